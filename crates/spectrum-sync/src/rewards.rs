//! Block and uncle reward accounting.
//!
//! Pure functions over a [`MonetaryPolicy`]: the same inputs always produce
//! the same outputs, so they are safe to call from any ordered phase.

use crate::{Block, Uncle};
use alloy_primitives::U256;

const WEI_PER_COIN: u64 = 1_000_000_000_000_000_000;

/// Step-down reward schedule.
///
/// A step `(threshold, reward)` applies to every height strictly greater than
/// `threshold`; heights at or below the first threshold earn nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonetaryPolicy {
    /// Ascending by threshold.
    pub steps: Vec<(u64, U256)>,
    /// Height from which uncles are paid from the schedule at their own
    /// height rather than the including block's height.
    pub uncle_fix_height: u64,
}

impl MonetaryPolicy {
    /// Base block reward at `height`.
    pub fn reward_at(&self, height: u64) -> U256 {
        self.steps
            .iter()
            .rev()
            .find(|(threshold, _)| height > *threshold)
            .map(|(_, reward)| *reward)
            .unwrap_or(U256::ZERO)
    }

    pub fn uncle_fix_active(&self, height: u64) -> bool {
        height >= self.uncle_fix_height
    }
}

impl Default for MonetaryPolicy {
    /// Ubiq mainnet schedule.
    fn default() -> Self {
        let coins = |n: u64| U256::from(n) * U256::from(WEI_PER_COIN);
        Self {
            steps: vec![
                (0, coins(8)),
                (358_363, coins(7)),
                (716_727, coins(6)),
                (1_075_090, coins(5)),
                (1_433_454, coins(4)),
                (1_791_818, coins(3)),
                (2_150_181, coins(2)),
                (2_508_545, coins(1)),
            ],
            uncle_fix_height: 1_075_090,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewards {
    /// Miner reward including the per-uncle inclusion bonus.
    pub block_reward: U256,
    /// One entry per uncle, in input order.
    pub uncle_rewards: Vec<U256>,
    /// Block reward plus all uncle rewards.
    pub minted: U256,
}

impl Rewards {
    pub fn uncle_total(&self) -> U256 {
        self.uncle_rewards
            .iter()
            .fold(U256::ZERO, |acc, reward| acc + *reward)
    }
}

/// Reward for an uncle at `uncle_number` included at `block_number`:
/// `(uncle + 2 - block) * base / 2`, floored at zero.
pub fn uncle_reward(block_number: u64, uncle_number: u64, base: U256) -> U256 {
    let depth_factor = (uncle_number + 2).saturating_sub(block_number);
    U256::from(depth_factor) * base / U256::from(2u64)
}

/// Compute the block reward, per-uncle rewards and total minted value.
pub fn accumulate_rewards(block: &Block, uncles: &[Uncle], policy: &MonetaryPolicy) -> Rewards {
    let mut block_reward = policy.reward_at(block.number);
    let fix_active = policy.uncle_fix_active(block.number);
    let mut uncle_rewards = Vec::with_capacity(uncles.len());
    let mut minted = U256::ZERO;

    for uncle in uncles {
        let base = if fix_active {
            policy.reward_at(uncle.number)
        } else {
            policy.reward_at(block.number)
        };

        let reward = uncle_reward(block.number, uncle.number, base);
        minted += reward;
        uncle_rewards.push(reward);

        block_reward += base / U256::from(32u64);
    }

    minted += block_reward;

    Rewards {
        block_reward,
        uncle_rewards,
        minted,
    }
}
