//! Rule ordering by tag flow.
//!
//! Rule A runs before rule B when A can produce a tag B consumes. A rule
//! that consumes its own output, directly or through other rules, would
//! fire forever and is rejected.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::resolve::ResolveError;
use crate::resolved::Rule;

/// Returns rule indices in application order.
pub fn order_rules(product: &str, rules: &[Rule]) -> Result<Vec<usize>, ResolveError> {
  let mut graph = DiGraph::<usize, ()>::new();
  let nodes: Vec<_> = (0..rules.len()).map(|i| graph.add_node(i)).collect();

  for (i, producer) in rules.iter().enumerate() {
    let produced = producer.produced_tags();
    for (j, consumer) in rules.iter().enumerate() {
      if produced.is_disjoint(&consumer.consumed_tags()) {
        continue;
      }
      if i == j {
        return Err(ResolveError::RuleCycle {
          product: product.to_string(),
          rule: producer.name.clone(),
        });
      }
      graph.update_edge(nodes[i], nodes[j], ());
    }
  }

  toposort(&graph, None)
    .map(|order| order.into_iter().map(|n| graph[n]).collect())
    .map_err(|cycle| ResolveError::RuleCycle {
      product: product.to_string(),
      rule: rules[graph[cycle.node_id()]].name.clone(),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resolved::{ArtifactTemplate, tags};

  fn rule(name: &str, input: &str, output: &str) -> Rule {
    Rule {
      name: name.to_string(),
      inputs: tags([input]),
      artifacts: vec![ArtifactTemplate::new("$${input.baseName}.out", tags([output]))],
      ..Default::default()
    }
  }

  #[test]
  fn chain_is_ordered_by_tags() {
    let rules = vec![rule("c_to_d", "c", "d"), rule("a_to_b", "a", "b"), rule("b_to_c", "b", "c")];
    let order = order_rules("app", &rules).unwrap();
    let names: Vec<_> = order.iter().map(|&i| rules[i].name.as_str()).collect();
    assert_eq!(names, vec!["a_to_b", "b_to_c", "c_to_d"]);
  }

  #[test]
  fn self_consuming_rule_is_a_cycle() {
    let rules = vec![rule("loop", "a", "a")];
    let err = order_rules("app", &rules).unwrap_err();
    assert!(matches!(err, ResolveError::RuleCycle { ref rule, .. } if rule == "loop"));
  }

  #[test]
  fn indirect_cycle_is_rejected() {
    let rules = vec![rule("x", "a", "b"), rule("y", "b", "a")];
    assert!(matches!(
      order_rules("app", &rules),
      Err(ResolveError::RuleCycle { .. })
    ));
  }

  #[test]
  fn explicit_dependencies_create_order() {
    let generator = rule("gen", "idl", "hpp");
    let mut compiler = rule("compile", "cpp", "obj");
    compiler.explicitly_depends_on = tags(["hpp"]);
    let rules = vec![compiler, generator];
    let order = order_rules("app", &rules).unwrap();
    assert_eq!(order, vec![1, 0]);
  }
}
