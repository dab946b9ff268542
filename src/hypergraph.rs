use crate::error::EngineError;
use crate::{EdgeId, EdgeWeight, NodeId, NodeWeight};

/// Immutable hypergraph in CSR form: pins grouped by hyperedge and incident
/// hyperedges grouped by node.
pub struct Hypergraph {
    num_nodes: usize,
    node_weights: Vec<NodeWeight>,
    edge_weights: Vec<EdgeWeight>,
    edge_offsets: Vec<usize>,
    pins: Vec<NodeId>,
    node_offsets: Vec<usize>,
    incident_edges: Vec<EdgeId>,
    total_node_weight: NodeWeight,
}

impl Hypergraph {
    /// Builds a hypergraph from one pin list per hyperedge.
    ///
    /// Passing `None` for either weight vector means unit weights.
    pub fn from_edges(
        num_nodes: usize,
        edges: &[Vec<NodeId>],
        edge_weights: Option<Vec<EdgeWeight>>,
        node_weights: Option<Vec<NodeWeight>>,
    ) -> Result<Self, EngineError> {
        let edge_weights = edge_weights.unwrap_or_else(|| vec![1; edges.len()]);
        let node_weights = node_weights.unwrap_or_else(|| vec![1; num_nodes]);
        if edge_weights.len() != edges.len() {
            return Err(EngineError::LengthMismatch {
                what: "edge_weights",
                expected: edges.len(),
                got: edge_weights.len(),
            });
        }
        if node_weights.len() != num_nodes {
            return Err(EngineError::LengthMismatch {
                what: "node_weights",
                expected: num_nodes,
                got: node_weights.len(),
            });
        }
        if node_weights.iter().any(|&w| w <= 0) {
            return Err(EngineError::NonPositiveWeight("node weight"));
        }
        if edge_weights.iter().any(|&w| w <= 0) {
            return Err(EngineError::NonPositiveWeight("edge weight"));
        }

        let mut edge_offsets = Vec::with_capacity(edges.len() + 1);
        let mut pins = Vec::new();
        edge_offsets.push(0);
        for (e, edge) in edges.iter().enumerate() {
            if edge.is_empty() {
                return Err(EngineError::EmptyHyperedge(e));
            }
            for &pin in edge {
                if pin as usize >= num_nodes {
                    return Err(EngineError::PinOutOfRange {
                        edge: e,
                        pin,
                        num_nodes,
                    });
                }
                pins.push(pin);
            }
            edge_offsets.push(pins.len());
        }

        // Invert the pin lists into per-node incidence lists.
        let mut degrees = vec![0usize; num_nodes];
        for &pin in &pins {
            degrees[pin as usize] += 1;
        }
        let mut node_offsets = Vec::with_capacity(num_nodes + 1);
        node_offsets.push(0);
        for v in 0..num_nodes {
            node_offsets.push(node_offsets[v] + degrees[v]);
        }
        let mut cursor = node_offsets.clone();
        let mut incident_edges = vec![0 as EdgeId; pins.len()];
        for e in 0..edges.len() {
            for &pin in &pins[edge_offsets[e]..edge_offsets[e + 1]] {
                incident_edges[cursor[pin as usize]] = e as EdgeId;
                cursor[pin as usize] += 1;
            }
        }

        let total_node_weight = node_weights.iter().sum();
        Ok(Self {
            num_nodes,
            node_weights,
            edge_weights,
            edge_offsets,
            pins,
            node_offsets,
            incident_edges,
            total_node_weight,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edge_offsets.len() - 1
    }

    pub fn num_pins(&self) -> usize {
        self.pins.len()
    }

    pub fn node_weight(&self, v: NodeId) -> NodeWeight {
        self.node_weights[v as usize]
    }

    pub fn total_node_weight(&self) -> NodeWeight {
        self.total_node_weight
    }

    pub fn edge_weight(&self, e: EdgeId) -> EdgeWeight {
        self.edge_weights[e as usize]
    }

    pub fn edge_size(&self, e: EdgeId) -> usize {
        self.edge_offsets[e as usize + 1] - self.edge_offsets[e as usize]
    }

    pub fn pins(&self, e: EdgeId) -> &[NodeId] {
        &self.pins[self.edge_offsets[e as usize]..self.edge_offsets[e as usize + 1]]
    }

    pub fn incident_edges(&self, v: NodeId) -> &[EdgeId] {
        &self.incident_edges[self.node_offsets[v as usize]..self.node_offsets[v as usize + 1]]
    }

    pub fn node_degree(&self, v: NodeId) -> usize {
        self.incident_edges(v).len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        0..self.num_nodes as NodeId
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeId> {
        0..self.num_edges() as EdgeId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_round_trip() {
        let hg = Hypergraph::from_edges(
            5,
            &[vec![0, 1, 2], vec![2, 3], vec![3, 4], vec![0, 4]],
            None,
            None,
        )
        .unwrap();

        assert_eq!(hg.num_nodes(), 5);
        assert_eq!(hg.num_edges(), 4);
        assert_eq!(hg.num_pins(), 9);
        assert_eq!(hg.pins(0), &[0, 1, 2]);
        assert_eq!(hg.edge_size(1), 2);
        assert_eq!(hg.incident_edges(2), &[0, 1]);
        assert_eq!(hg.incident_edges(4), &[2, 3]);
        assert_eq!(hg.total_node_weight(), 5);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Hypergraph::from_edges(2, &[vec![0, 5]], None, None),
            Err(EngineError::PinOutOfRange { .. })
        ));
        assert!(matches!(
            Hypergraph::from_edges(2, &[vec![]], None, None),
            Err(EngineError::EmptyHyperedge(0))
        ));
        assert!(matches!(
            Hypergraph::from_edges(2, &[vec![0]], Some(vec![1, 1]), None),
            Err(EngineError::LengthMismatch { .. })
        ));
        assert!(matches!(
            Hypergraph::from_edges(2, &[vec![0]], Some(vec![0]), None),
            Err(EngineError::NonPositiveWeight(_))
        ));
    }
}
