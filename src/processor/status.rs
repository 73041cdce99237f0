//! Per-run status tree: image → symbol → sources.
//!
//! Serialized as one JSON file per binary inside the status package, so a later
//! delete or retry knows what was stored.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{ImageName, SourceName, SymbolName};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionStatus {
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl From<&Error> for ExceptionStatus {
    fn from(error: &Error) -> Self {
        Self {
            message: error.to_string(),
            detail: Some(format!("{:?}", error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_name: SourceName,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub exception: Option<ExceptionStatus>,
}

impl SourceStatus {
    pub fn new(source_name: SourceName) -> Self {
        Self {
            source_name,
            stored: false,
            exception: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub symbol_name: SymbolName,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub exception: Option<ExceptionStatus>,
    #[serde(default)]
    pub source_statuses: Option<Vec<SourceStatus>>,
}

impl SymbolStatus {
    pub fn new(symbol_name: SymbolName) -> Self {
        Self {
            symbol_name,
            stored: false,
            exception: None,
            source_statuses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStatus {
    pub image_name: ImageName,
    #[serde(default)]
    pub symbol_status: Option<SymbolStatus>,
    #[serde(default)]
    pub exception: Option<ExceptionStatus>,
}

impl ImageStatus {
    pub fn new(image_name: ImageName) -> Self {
        Self {
            image_name,
            symbol_status: None,
            exception: None,
        }
    }

    /// True when the whole tree matches `expected_stored` and carries no error
    pub fn check(&self, expected_stored: bool) -> bool {
        StatusNode::Image(self).check(expected_stored)
    }
}

/// A borrowed node of the status tree.
#[derive(Debug, Clone, Copy)]
pub enum StatusNode<'a> {
    Image(&'a ImageStatus),
    Symbol(&'a SymbolStatus),
    Source(&'a SourceStatus),
}

impl<'a> StatusNode<'a> {
    /// Images carry no stored flag of their own
    fn stored(&self) -> Option<bool> {
        match self {
            StatusNode::Image(_) => None,
            StatusNode::Symbol(symbol) => Some(symbol.stored),
            StatusNode::Source(source) => Some(source.stored),
        }
    }

    fn exception(&self) -> Option<&'a ExceptionStatus> {
        match *self {
            StatusNode::Image(image) => image.exception.as_ref(),
            StatusNode::Symbol(symbol) => symbol.exception.as_ref(),
            StatusNode::Source(source) => source.exception.as_ref(),
        }
    }

    fn children(&self) -> Vec<StatusNode<'a>> {
        match *self {
            StatusNode::Image(image) => image
                .symbol_status
                .iter()
                .map(StatusNode::Symbol)
                .collect(),
            StatusNode::Symbol(symbol) => symbol
                .source_statuses
                .iter()
                .flatten()
                .map(StatusNode::Source)
                .collect(),
            StatusNode::Source(_) => Vec::new(),
        }
    }

    pub fn check(&self, expected_stored: bool) -> bool {
        self.stored().map_or(true, |stored| stored == expected_stored)
            && self.exception().is_none()
            && self
                .children()
                .iter()
                .all(|child| child.check(expected_stored))
    }
}
