use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tmtc::definition::{ExpressionDefinition, ParameterDefinition};
use tmtc::graph::{topological_order, GraphModel};
use tmtc::{ProcessingDefinition, Sequencer};

/// Parameter `i` may only reference parameters declared before it, so the
/// generated definitions are always acyclic.
fn acyclic_definition() -> impl Strategy<Value = ProcessingDefinition> {
    (2usize..24)
        .prop_flat_map(|n| {
            let refs = (0..n)
                .map(|i| prop::collection::btree_set(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>();
            (Just(n), refs)
        })
        .prop_map(|(n, refs)| {
            let mut parameters = Vec::with_capacity(n);
            for (i, used) in refs.into_iter().enumerate() {
                let mut p = ParameterDefinition::new(i as i32 + 1, format!("SC.G{}.P{}", i % 3, i));
                let used: Vec<usize> = used.into_iter().filter(|r| *r < i).collect();
                let mut expr: Option<ExpressionDefinition> = None;
                for r in used {
                    let term = ExpressionDefinition::reference(format!("SC.G{}.P{}", r % 3, r));
                    expr = Some(match expr {
                        None => term,
                        Some(left) => ExpressionDefinition::Add {
                            left: Box::new(left),
                            right: Box::new(term),
                        },
                    });
                }
                p.expression = expr;
                parameters.push(p);
            }
            ProcessingDefinition {
                parameters,
                ..Default::default()
            }
        })
}

proptest! {
    #[test]
    fn test_every_dependent_ranks_after_its_source(definition in acyclic_definition()) {
        let graph = GraphModel::build(&definition, &Sequencer::new(), Utc::now()).unwrap();
        for node in graph.nodes() {
            let rank = graph.rank_of(node.id).unwrap();
            for dependent in graph.dependents_of(node.id) {
                prop_assert!(rank < graph.rank_of(*dependent).unwrap());
            }
        }
    }

    #[test]
    fn test_closure_is_reachable_set_in_order(definition in acyclic_definition(), seed in 1i32..24) {
        let graph = GraphModel::build(&definition, &Sequencer::new(), Utc::now()).unwrap();
        let seed = seed.min(definition.parameters.len() as i32);
        let closure = graph.closure([seed]).unwrap();

        prop_assert_eq!(closure[0], seed);
        let ranks: Vec<usize> = closure.iter().map(|id| graph.rank_of(*id).unwrap()).collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] < w[1]));

        let members: BTreeSet<i32> = closure.iter().copied().collect();
        for id in &closure {
            for dependent in graph.dependents_of(*id) {
                prop_assert!(members.contains(dependent));
            }
        }
    }

    #[test]
    fn test_topological_order_rejects_cycles(len in 2i32..12) {
        let mut edges: BTreeSet<(i32, i32)> = (1..len).map(|i| (i, i + 1)).collect();
        prop_assert!(topological_order(1..=len, &edges).is_ok());

        edges.insert((len, 1));
        let stuck = topological_order(1..=len, &edges).unwrap_err();
        prop_assert_eq!(stuck.len(), len as usize);
    }
}
