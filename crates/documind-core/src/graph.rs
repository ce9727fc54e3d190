//! Knowledge-graph projection.
//!
//! [`build_knowledge_graph`] is purely structural: sections and entities
//! become nodes, relations become edges, and each section gets a `contains`
//! edge to every entity whose name appears in its text. The output depends
//! only on the input [`Analysis`], so building twice yields identical graphs.
//!
//! Node order is: section nodes (`section:0`, `section:1`, ...) in section
//! order, then entity nodes in entity order. Downstream ranking breaks ties
//! by this order.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::{Analysis, Cluster, Edge, KnowledgeGraph, Node, RelationKind, SECTION_KIND};

/// Number of ids reported in [`KnowledgeGraph::central_nodes`].
pub const CENTRAL_NODE_LIMIT: usize = 5;

/// Malformed analysis. Any of these indicates a broken contract upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("empty node id")]
    EmptyId,
    #[error("edge {from} -> {to} references a nonexistent node")]
    DanglingEdge { from: String, to: String },
}

/// Default importance for a section without an analyzer-tagged score.
/// Shallower headings rank higher.
pub fn section_importance(level: u8) -> f64 {
    (1.0 - 0.2 * f64::from(level)).clamp(0.1, 1.0)
}

pub fn section_node_id(index: usize) -> String {
    format!("section:{index}")
}

/// Project an analysis into a knowledge graph.
pub fn build_knowledge_graph(analysis: &Analysis) -> Result<KnowledgeGraph, GraphError> {
    let mut nodes = Vec::with_capacity(analysis.sections.len() + analysis.entities.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut push = |node: Node, nodes: &mut Vec<Node>| -> Result<(), GraphError> {
        if node.id.trim().is_empty() {
            return Err(GraphError::EmptyId);
        }
        if index.insert(node.id.clone(), nodes.len()).is_some() {
            return Err(GraphError::DuplicateNode(node.id));
        }
        nodes.push(node);
        Ok(())
    };

    for (i, section) in analysis.sections.iter().enumerate() {
        let importance = section
            .importance
            .unwrap_or_else(|| section_importance(section.level))
            .clamp(0.0, 1.0);
        push(
            Node {
                id: section_node_id(i),
                label: section.title.clone(),
                kind: SECTION_KIND.to_string(),
                importance,
                text: section.text.clone(),
            },
            &mut nodes,
        )?;
    }

    for entity in &analysis.entities {
        push(
            Node {
                id: entity.id.clone(),
                label: entity.name.clone(),
                kind: entity.kind.as_str().to_string(),
                importance: entity.importance.clamp(0.0, 1.0),
                text: entity.description.clone(),
            },
            &mut nodes,
        )?;
    }

    let mut edges = Vec::new();

    for (i, section) in analysis.sections.iter().enumerate() {
        for entity in &analysis.entities {
            if !entity.name.is_empty() && section.text.contains(&entity.name) {
                edges.push(Edge {
                    source: section_node_id(i),
                    target: entity.id.clone(),
                    label: RelationKind::Contains.as_str().to_string(),
                    weight: 1.0,
                });
            }
        }
    }

    for relation in &analysis.relations {
        if !index.contains_key(relation.source.as_str())
            || !index.contains_key(relation.target.as_str())
        {
            return Err(GraphError::DanglingEdge {
                from: relation.source.clone(),
                to: relation.target.clone(),
            });
        }
        edges.push(Edge {
            source: relation.source.clone(),
            target: relation.target.clone(),
            label: relation.kind.as_str().to_string(),
            weight: relation.strength.clamp(0.0, 1.0),
        });
    }

    let clusters = connected_clusters(&nodes, &edges);
    let central_nodes = central_nodes(&nodes, &edges);

    Ok(KnowledgeGraph {
        nodes,
        edges,
        clusters,
        central_nodes,
    })
}

fn nodes_index(nodes: &[Node]) -> HashMap<&str, usize> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect()
}

/// Union-find over undirected edges. Components with at least two nodes
/// become clusters, ordered by their earliest node.
fn connected_clusters(nodes: &[Node], edges: &[Edge]) -> Vec<Cluster> {
    let index = nodes_index(nodes);
    let mut parent: Vec<usize> = (0..nodes.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for edge in edges {
        let endpoints = (
            index.get(edge.source.as_str()),
            index.get(edge.target.as_str()),
        );
        if let (Some(&a), Some(&b)) = endpoints {
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                // keep the smaller index as root so component order is stable
                let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
                parent[hi] = lo;
            }
        }
    }

    let mut groups: Vec<(usize, Vec<String>)> = Vec::new();
    let mut by_root: HashMap<usize, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = *by_root.entry(root).or_insert_with(|| {
            groups.push((root, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(node.id.clone());
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .enumerate()
        .map(|(i, (_, members))| Cluster {
            id: format!("cluster-{i}"),
            nodes: members,
        })
        .collect()
}

/// Top nodes by importance, then degree, then insertion order.
fn central_nodes(nodes: &[Node], edges: &[Edge]) -> Vec<String> {
    let mut degree: HashMap<&str, usize> = HashMap::new();
    for edge in edges {
        *degree.entry(edge.source.as_str()).or_default() += 1;
        *degree.entry(edge.target.as_str()).or_default() += 1;
    }

    let mut ranked: Vec<(usize, &Node)> = nodes.iter().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| {
                let da = degree.get(a.id.as_str()).copied().unwrap_or(0);
                let db = degree.get(b.id.as_str()).copied().unwrap_or(0);
                db.cmp(&da)
            })
            .then_with(|| ia.cmp(ib))
    });

    ranked
        .into_iter()
        .take(CENTRAL_NODE_LIMIT)
        .map(|(_, n)| n.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityKind, Relation, Section};

    fn entity(id: &str, name: &str, importance: f64) -> Entity {
        Entity {
            id: id.into(),
            name: name.into(),
            kind: EntityKind::Tool,
            description: format!("{name} description"),
            importance,
            mentions: 1,
            spans: vec![],
        }
    }

    fn relation(source: &str, target: &str) -> Relation {
        Relation {
            source: source.into(),
            target: target.into(),
            kind: RelationKind::Uses,
            strength: 0.5,
            description: String::new(),
        }
    }

    fn sample() -> Analysis {
        Analysis {
            entities: vec![
                entity("cargo", "Cargo", 0.9),
                entity("rustc", "rustc", 0.7),
                entity("clippy", "Clippy", 0.2),
            ],
            sections: vec![Section {
                title: "Building".into(),
                text: "Cargo drives rustc.".into(),
                level: 1,
                importance: None,
            }],
            relations: vec![relation("cargo", "rustc")],
            ..Default::default()
        }
    }

    #[test]
    fn projects_sections_then_entities() {
        let graph = build_knowledge_graph(&sample()).unwrap();
        let ids: Vec<_> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["section:0", "cargo", "rustc", "clippy"]);
        assert!((graph.nodes[0].importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn adds_contains_edges_for_mentioned_entities() {
        let graph = build_knowledge_graph(&sample()).unwrap();
        let contains: Vec<_> = graph
            .edges
            .iter()
            .filter(|e| e.label == "contains")
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(contains, vec!["cargo", "rustc"]);
    }

    #[test]
    fn building_twice_is_identical() {
        let analysis = sample();
        let a = build_knowledge_graph(&analysis).unwrap();
        let b = build_knowledge_graph(&analysis).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dangling_relation_is_rejected() {
        let mut analysis = sample();
        analysis.relations.push(relation("cargo", "ghost"));
        let err = build_knowledge_graph(&analysis).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingEdge {
                from: "cargo".into(),
                to: "ghost".into()
            }
        );
    }

    #[test]
    fn duplicate_entity_id_is_rejected() {
        let mut analysis = sample();
        analysis.entities.push(entity("cargo", "Cargo again", 0.1));
        assert_eq!(
            build_knowledge_graph(&analysis).unwrap_err(),
            GraphError::DuplicateNode("cargo".into())
        );
    }

    #[test]
    fn clusters_and_central_nodes() {
        let graph = build_knowledge_graph(&sample()).unwrap();
        assert_eq!(graph.clusters.len(), 1);
        assert_eq!(
            graph.clusters[0].nodes,
            vec!["section:0".to_string(), "cargo".into(), "rustc".into()]
        );
        assert_eq!(graph.central_nodes[0], "cargo");
        assert_eq!(graph.central_nodes.last().map(String::as_str), Some("clippy"));
    }

    #[test]
    fn empty_analysis_gives_empty_graph() {
        let graph = build_knowledge_graph(&Analysis::default()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.edges.is_empty());
        assert!(graph.central_nodes.is_empty());
    }
}
