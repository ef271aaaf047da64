use std::collections::HashMap;

/// 上游只读接口的操作类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ListChannels,
    ListVideos,
    ListPlaylistItems,
    Search,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListChannels => "channels.list",
            Self::ListVideos => "videos.list",
            Self::ListPlaylistItems => "playlistItems.list",
            Self::Search => "search.list",
        }
    }

    /// YouTube Data API v3 公布的单次调用成本。
    pub fn default_cost(self) -> u32 {
        match self {
            Self::Search => 100,
            Self::ListChannels | Self::ListVideos | Self::ListPlaylistItems => 1,
        }
    }
}

/// 操作 -> 配额单位的静态映射，允许覆盖个别项。
#[derive(Debug, Clone, Default)]
pub struct CostTable {
    overrides: HashMap<OperationKind, u32>,
}

impl CostTable {
    pub fn with_override(mut self, op: OperationKind, units: u32) -> Self {
        self.overrides.insert(op, units);
        self
    }

    pub fn cost(&self, op: OperationKind) -> u32 {
        self.overrides
            .get(&op)
            .copied()
            .unwrap_or_else(|| op.default_cost())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_costs() {
        let t = CostTable::default();
        assert_eq!(t.cost(OperationKind::ListChannels), 1);
        assert_eq!(t.cost(OperationKind::ListVideos), 1);
        assert_eq!(t.cost(OperationKind::ListPlaylistItems), 1);
        assert_eq!(t.cost(OperationKind::Search), 100);
    }

    #[test]
    fn overrides_take_precedence() {
        let t = CostTable::default().with_override(OperationKind::Search, 50);
        assert_eq!(t.cost(OperationKind::Search), 50);
        assert_eq!(t.cost(OperationKind::ListVideos), 1);
    }
}
