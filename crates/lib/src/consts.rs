/// Application name, used for lock metadata and log prefixes.
pub const APP_NAME: &str = "brick";

/// Suffix of the persisted build graph file inside the build directory.
pub const BUILD_GRAPH_SUFFIX: &str = ".bg.json";

/// Version of the persisted build graph format. Bump on incompatible changes.
pub const BUILD_GRAPH_VERSION: u32 = 1;

/// Lock file guarding a build directory.
pub const LOCK_FILENAME: &str = ".brick.lock";

/// Default argument prefix for response files (`@args.rsp`).
pub const RESPONSE_FILE_PREFIX: &str = "@";

/// Default build directory used by the CLI.
pub const DEFAULT_BUILD_DIR: &str = "build";
