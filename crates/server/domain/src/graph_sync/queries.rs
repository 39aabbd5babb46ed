//! Read-only units of work

use super::connection::{GraphTransaction, UnitOfWork};
use super::mutation::{Direction, Neighbor};
use super::operation::{NodeRef, Properties};
use super::GraphError;
use async_trait::async_trait;

/// Properties of one node, if it exists
#[derive(Debug, Clone, PartialEq)]
pub struct FindNode(pub NodeRef);

#[async_trait]
impl UnitOfWork for FindNode {
    type Output = Option<Properties>;

    async fn run(&self, tx: &mut dyn GraphTransaction) -> Result<Self::Output, GraphError> {
        self.0.validate()?;
        tx.find_node(&self.0).await
    }
}

/// Number of nodes carrying a label, soft-deleted ones included
#[derive(Debug, Clone, PartialEq)]
pub struct CountNodes(pub String);

#[async_trait]
impl UnitOfWork for CountNodes {
    type Output = u64;

    async fn run(&self, tx: &mut dyn GraphTransaction) -> Result<Self::Output, GraphError> {
        tx.count_nodes(&self.0).await
    }
}

/// Relationships of one type around a node
#[derive(Debug, Clone, PartialEq)]
pub struct FindNeighbors {
    pub node: NodeRef,
    pub rel_type: String,
    pub direction: Direction,
}

#[async_trait]
impl UnitOfWork for FindNeighbors {
    type Output = Vec<Neighbor>;

    async fn run(&self, tx: &mut dyn GraphTransaction) -> Result<Self::Output, GraphError> {
        self.node.validate()?;
        tx.neighbors(&self.node, &self.rel_type, self.direction).await
    }
}
