pub mod auth;
pub mod games;
pub mod reports;
pub mod wallet;

fn default_page_limit() -> i64 {
    50
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

impl PageQuery {
    /// Clamps the client-supplied page size so a single request cannot
    /// force an unbounded table scan.
    pub fn page(&self) -> wagerbridge_core::Page {
        wagerbridge_core::Page {
            offset: self.offset.max(0),
            limit: self.limit.clamp(1, 200),
        }
    }
}
