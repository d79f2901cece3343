//! Placeholder expansion for artifact templates.
//!
//! A rule's static output declarations name their files with placeholders
//! that are filled in per input (or once per rule for multiplex rules).
//!
//! # Placeholder Formats
//!
//! - `$${input.fileName}`, `$${input.baseName}`, `$${input.completeBaseName}`,
//!   `$${input.suffix}`, `$${input.dir}` - parts of the matched input path
//! - `$${product.name}`, `$${product.buildDirectory}` - the owning product
//!
//! # Escaping
//!
//! Single `$` characters pass through unchanged. Use `$$$` before `{` to
//! produce a literal `$${`.
//!
//! # Example
//!
//! ```
//! use brick_lib::rules::template::{parse, InputField, Placeholder, Segment};
//!
//! let segments = parse("$${input.baseName}.o").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Input(InputField::BaseName)),
//!     Segment::Literal(".o".to_string()),
//! ]);
//! ```

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputField {
  FileName,
  BaseName,
  CompleteBaseName,
  Suffix,
  Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductField {
  Name,
  BuildDirectory,
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
  Input(InputField),
  Product(ProductField),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("placeholder '{0}' needs a single input")]
  NoInput(String),
}

/// Supplies values for placeholders.
pub trait Resolver {
  /// `None` when the template is expanded without a single input.
  fn resolve_input(&self, field: InputField) -> Option<String>;

  fn resolve_product(&self, field: ProductField) -> String;
}

/// Parse a template string into segments.
///
/// # Errors
///
/// Returns an error for unclosed or unknown placeholders.
pub fn parse(input: &str) -> Result<Vec<Segment>, TemplateError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      // A lone $ passes through.
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
        }
      }
      Some((_, '{')) => {
        chars.next();
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          content.push(c);
        }
        if !closed {
          return Err(TemplateError::Unclosed(pos));
        }
        segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, TemplateError> {
  let placeholder = match content.trim() {
    "input.fileName" => Placeholder::Input(InputField::FileName),
    "input.baseName" => Placeholder::Input(InputField::BaseName),
    "input.completeBaseName" => Placeholder::Input(InputField::CompleteBaseName),
    "input.suffix" => Placeholder::Input(InputField::Suffix),
    "input.dir" => Placeholder::Input(InputField::Dir),
    "product.name" => Placeholder::Product(ProductField::Name),
    "product.buildDirectory" => Placeholder::Product(ProductField::BuildDirectory),
    other => return Err(TemplateError::Unknown(other.to_string())),
  };
  Ok(placeholder)
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, TemplateError> {
  let segments = parse(input)?;
  let mut result = String::new();

  for segment in &segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(Placeholder::Input(field)) => {
        let value = resolver
          .resolve_input(*field)
          .ok_or_else(|| TemplateError::NoInput(format!("{field:?}")))?;
        result.push_str(&value);
      }
      Segment::Placeholder(Placeholder::Product(field)) => result.push_str(&resolver.resolve_product(*field)),
    }
  }

  Ok(result)
}

/// True if the template refers to the matched input at all.
pub fn uses_input(input: &str) -> Result<bool, TemplateError> {
  Ok(
    parse(input)?
      .iter()
      .any(|s| matches!(s, Segment::Placeholder(Placeholder::Input(_)))),
  )
}
