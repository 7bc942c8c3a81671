use tracing::debug;

/// 一次调度分配：第 `slot` 个流本轮可发送 `chars` 个字符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub slot: usize,
    pub chars: usize,
}

/// 轮询调度器：把共享令牌桶的余额按流平分
///
/// 每轮 `share = max(1, floor(tokens / active))`，排队字符不足的流少发，
/// 剩余份额本轮不再分给其他流。起始位置每轮轮转一次。
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    cursor: usize,
    stats: SchedulerStats,
}

/// 调度器统计信息
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub rounds: u64,
    pub grants: u64,
    pub chars_granted: u64,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `queued[i]` 为槽位 `i` 的积压，`tokens` 为可用整数令牌
    pub fn plan(&mut self, tokens: usize, queued: &[usize]) -> Vec<Grant> {
        let active: Vec<usize> = (0..queued.len())
            .map(|i| (self.cursor + i) % queued.len().max(1))
            .filter(|&slot| queued[slot] > 0)
            .collect();
        if active.is_empty() || tokens == 0 {
            return Vec::new();
        }

        let share = (tokens / active.len()).max(1);
        let mut remaining = tokens;
        let mut grants = Vec::with_capacity(active.len());

        for slot in active {
            if remaining == 0 {
                break;
            }
            let chars = share.min(queued[slot]).min(remaining);
            remaining -= chars;
            grants.push(Grant { slot, chars });
        }

        self.cursor = (self.cursor + 1) % queued.len();
        self.stats.rounds += 1;
        self.stats.grants += grants.len() as u64;
        self.stats.chars_granted += grants.iter().map(|g| g.chars as u64).sum::<u64>();
        debug!("round-robin: {} tokens, share {}, {} grants", tokens, share, grants.len());

        grants
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }
}
