use std::collections::HashMap;

/// Per-session tool invocation counters, logged at turn end.
#[derive(Debug, Default, Clone)]
pub struct ToolStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cached_calls: u64,
    pub total_secs: f64,
    pub by_tool: HashMap<String, PerToolStats>,
}

#[derive(Debug, Default, Clone)]
pub struct PerToolStats {
    pub calls: u64,
    pub success: u64,
    pub failed: u64,
    pub cached: u64,
    pub total_secs: f64,
}

impl ToolStats {
    pub fn record(&mut self, tool: &str, success: bool, secs: f64, cached: bool) {
        self.total_calls += 1;
        self.total_secs += secs;
        let per = self.by_tool.entry(tool.to_string()).or_default();
        per.calls += 1;
        per.total_secs += secs;
        if cached {
            self.cached_calls += 1;
            per.cached += 1;
        } else if success {
            self.successful_calls += 1;
            per.success += 1;
        } else {
            self.failed_calls += 1;
            per.failed += 1;
        }
    }

    /// One-line summary for the turn-end log.
    pub fn summary(&self) -> String {
        format!(
            "calls={} ok={} failed={} cached={} total={:.2}s",
            self.total_calls,
            self.successful_calls,
            self.failed_calls,
            self.cached_calls,
            self.total_secs
        )
    }
}
