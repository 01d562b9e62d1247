use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDetails {
    pub asset_id: String,
    pub attributes: BTreeMap<String, String>,
}

impl AssetDetails {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    NotFound,
    /// Any answer other than the asset or "not found".
    Unexpected { status: u16, detail: String },
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound => write!(f, "asset not found"),
            LookupError::Unexpected { status, detail } => {
                write!(f, "unexpected asset lookup response {status}: {detail}")
            }
        }
    }
}

impl std::error::Error for LookupError {}

/// Resolves asset identities to their details (an inventory service in production).
#[async_trait]
pub trait AssetLookup: Send + Sync {
    async fn lookup(&self, asset_id: &str) -> Result<AssetDetails, LookupError>;
}

/// Fixed in-process inventory.
#[derive(Debug, Clone, Default)]
pub struct StaticAssetLookup {
    assets: HashMap<String, Result<AssetDetails, LookupError>>,
}

impl StaticAssetLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inventory knowing exactly `asset_ids`, without attributes.
    pub fn with_assets<I, S>(asset_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lookup = Self::new();
        for id in asset_ids {
            lookup.insert(AssetDetails::new(id));
        }
        lookup
    }

    pub fn insert(&mut self, details: AssetDetails) {
        self.assets.insert(details.asset_id.clone(), Ok(details));
    }

    /// Make lookups of `asset_id` fail with `error`.
    pub fn fail(&mut self, asset_id: impl Into<String>, error: LookupError) {
        self.assets.insert(asset_id.into(), Err(error));
    }
}

#[async_trait]
impl AssetLookup for StaticAssetLookup {
    async fn lookup(&self, asset_id: &str) -> Result<AssetDetails, LookupError> {
        self.assets.get(asset_id).cloned().unwrap_or(Err(LookupError::NotFound))
    }
}
