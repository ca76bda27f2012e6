use anyhow::Result;
use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "notifier")]
pub struct Config {
    /// Buffer size of each block-epoch subscriber's queue and delivery channel.
    #[arg(long, env = "EPOCH_QUEUE_SIZE", default_value_t = 20)]
    pub epoch_queue_size: usize,

    /// Bound on the filtered view's pending block events.
    #[arg(long, env = "BLOCK_QUEUE_SIZE", default_value_t = 50)]
    pub block_queue_size: usize,

    /// Depth after which confirmations are considered final by the tracker.
    #[arg(long, env = "REORG_SAFETY_LIMIT", default_value_t = 144)]
    pub reorg_safety_limit: u32,

    /// Whether the backend can serve headers of blocks it has since
    /// reorganized away. When set, missed-block recovery rewinds to the
    /// common ancestor before catching up.
    #[arg(
        long,
        env = "BACKEND_STORES_REORGS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub backend_stores_reorgs: bool,

    #[arg(long, env = "DISABLE_COMPACT_FILTERS")]
    pub disable_compact_filters: bool,

    #[arg(long, env = "DISABLE_TX_INDEX")]
    pub disable_tx_index: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Self::try_parse()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["notifier"])
    }
}
