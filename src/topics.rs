//! Bus topic namespace, rooted at `wfms/{site}`

use crate::command::CommandSource;

/// Resolved topic names for one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub base: String,
    /// Retained full state
    pub state: String,
    /// One sample per `DATA` frame
    pub telemetry: String,
    pub cmd_valve: String,
    pub cmd_mode: String,
    /// Generic operation commands
    pub cmd_op: String,
    pub ack: String,
    /// Retained online/offline announcement (also the last will)
    pub status: String,
}

impl Topics {
    pub fn new(site: &str) -> Self {
        let base = format!("wfms/{}", site);
        Self {
            state: format!("{}/state", base),
            telemetry: format!("{}/telemetry", base),
            cmd_valve: format!("{}/cmd/valve", base),
            cmd_mode: format!("{}/cmd/mode", base),
            cmd_op: format!("{}/cmd/op", base),
            ack: format!("{}/ack", base),
            status: format!("{}/status/gateway", base),
            base,
        }
    }

    /// Inbound topics to subscribe to
    pub fn command_topics(&self) -> [&str; 3] {
        [&self.cmd_valve, &self.cmd_mode, &self.cmd_op]
    }

    /// Which command surface a topic belongs to
    pub fn command_source(&self, topic: &str) -> Option<CommandSource> {
        if topic == self.cmd_valve {
            Some(CommandSource::Valve)
        } else if topic == self.cmd_mode {
            Some(CommandSource::Mode)
        } else if topic == self.cmd_op {
            Some(CommandSource::Operation)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let topics = Topics::new("lab1");
        assert_eq!(topics.state, "wfms/lab1/state");
        assert_eq!(topics.status, "wfms/lab1/status/gateway");
        assert_eq!(topics.command_topics()[2], "wfms/lab1/cmd/op");
    }

    #[test]
    fn test_command_source() {
        let topics = Topics::new("lab1");
        assert_eq!(topics.command_source("wfms/lab1/cmd/mode"), Some(CommandSource::Mode));
        assert_eq!(topics.command_source("wfms/lab2/cmd/mode"), None);
        assert_eq!(topics.command_source(&topics.ack), None);
    }
}
