// 9.4: per-user instruction pacing. duplicate notifications at one height
// collapse into a single instruction.

use crate::types::{BlockHeight, UserId};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_height_delta: u64,
    last_sent: HashMap<UserId, BlockHeight>,
}

impl RateLimiter {
    pub fn new(min_height_delta: u64) -> Self {
        Self {
            min_height_delta,
            last_sent: HashMap::new(),
        }
    }

    pub fn permits(&self, user: UserId, height: BlockHeight) -> bool {
        match self.last_sent.get(&user) {
            Some(last) => height.since(*last) >= self.min_height_delta && height > *last,
            None => true,
        }
    }

    pub fn record(&mut self, user: UserId, height: BlockHeight) {
        self.last_sent.insert(user, height);
    }

    pub fn forget(&mut self, user: UserId) {
        self.last_sent.remove(&user);
    }
}
