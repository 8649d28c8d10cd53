//! Computation targets.
//!
//! A [`ComputationTarget`] identifies *what* a value is about: a portfolio
//! node, a position, a security, a trade, or a primitive (e.g. a currency or
//! a market data ticker).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::TargetId;

/// Kind of entity a computation target refers to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationTargetKind {
    /// Node in a portfolio tree
    PortfolioNode,
    /// Position (quantity of a security)
    Position,
    /// Security
    Security,
    /// Trade
    Trade,
    /// Primitive (currency, ticker, curve name, ...)
    Primitive,
}

impl ComputationTargetKind {
    /// All target kinds.
    pub const ALL: [ComputationTargetKind; 5] = [
        ComputationTargetKind::PortfolioNode,
        ComputationTargetKind::Position,
        ComputationTargetKind::Security,
        ComputationTargetKind::Trade,
        ComputationTargetKind::Primitive,
    ];

    /// Short uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortfolioNode => "PORTFOLIO_NODE",
            Self::Position => "POSITION",
            Self::Security => "SECURITY",
            Self::Trade => "TRADE",
            Self::Primitive => "PRIMITIVE",
        }
    }
}

impl fmt::Display for ComputationTargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed handle to the entity a value is computed for. Immutable.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ComputationTarget {
    /// Target kind
    pub kind: ComputationTargetKind,
    /// Unique identifier within the kind
    pub id: TargetId,
}

impl ComputationTarget {
    /// Create a new target.
    pub fn new(kind: ComputationTargetKind, id: impl Into<TargetId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Position target.
    pub fn position(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetKind::Position, id)
    }

    /// Security target.
    pub fn security(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetKind::Security, id)
    }

    /// Trade target.
    pub fn trade(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetKind::Trade, id)
    }

    /// Portfolio node target.
    pub fn portfolio_node(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetKind::PortfolioNode, id)
    }

    /// Primitive target.
    pub fn primitive(id: impl Into<TargetId>) -> Self {
        Self::new(ComputationTargetKind::Primitive, id)
    }
}

impl fmt::Display for ComputationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
