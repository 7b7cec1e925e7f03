use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pagination {
    #[serde(default = "default_index")]
    pub index: u64,
    #[serde(default = "default_size")]
    pub size: u64,
}

fn default_index() -> u64 {
    1
}

fn default_size() -> u64 {
    10
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            index: default_index(),
            size: default_size(),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub index: u64,
    pub size: u64,
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        self.index.saturating_sub(1).saturating_mul(self.size)
    }

    pub fn limit(&self) -> u64 {
        self.size
    }

    pub fn check(&self) -> Self {
        if self.index < 1 || self.size < 1 {
            return Self::default();
        }
        self.clone()
    }

    /// Cuts the page out of a full listing.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let page = self.check();
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(usize::try_from(page.limit()).unwrap_or(usize::MAX))
            .collect();
        Page {
            items,
            total,
            index: page.index,
            size: page.size,
        }
    }
}
