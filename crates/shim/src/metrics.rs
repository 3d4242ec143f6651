/*
   Copyright The containerd Authors.

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

/// Per-operation RPC duration accounting.
///
/// Kept in process; there is no exposition endpoint, the numbers are for
/// debug logging and post-mortem inspection.
#[derive(Default)]
pub struct RpcMetrics {
    ops: Mutex<HashMap<&'static str, OpStat>>,
}

#[derive(Default, Clone, Copy)]
struct OpStat {
    count: u64,
    total: Duration,
}

impl RpcMetrics {
    pub fn observe(&self, op: &'static str, elapsed: Duration) {
        let mut ops = self.ops.lock().unwrap();
        let stat = ops.entry(op).or_default();
        stat.count += 1;
        stat.total += elapsed;
        debug!("rpc {} took {:?} (count={})", op, elapsed, stat.count);
    }

    pub fn count(&self, op: &str) -> u64 {
        self.ops
            .lock()
            .unwrap()
            .get(op)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_operation() {
        let m = RpcMetrics::default();
        m.observe("create", Duration::from_millis(3));
        m.observe("create", Duration::from_millis(2));
        m.observe("state", Duration::from_millis(1));
        assert_eq!(m.count("create"), 2);
        assert_eq!(m.count("state"), 1);
        assert_eq!(m.count("wait"), 0);
    }
}
