//! Dataframe registry entries.

use serde::{Deserialize, Serialize};

use crate::ids::BlockId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrameColumn {
    pub name: String,
    pub dtype: String,
}

impl DataFrameColumn {
    pub fn new(name: impl Into<String>, dtype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.into(),
        }
    }
}

/// A dataframe as reported by the kernel's dataframe lister.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrameInfo {
    pub name: String,
    pub columns: Vec<DataFrameColumn>,
}

/// A registry entry: which dataframe exists and which block produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub name: String,
    pub columns: Vec<DataFrameColumn>,
    pub updated_at: u64,
    /// Producing block. `None` for dataframes created outside any block.
    pub block_id: Option<BlockId>,
}
