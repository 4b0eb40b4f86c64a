/// Request queues of one worker, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerQueues {
    pub attack: String,
    pub agent: String,
    pub control: String,
}

impl WorkerQueues {
    pub fn for_worker(name: &str) -> Self {
        Self {
            attack: format!("cryton_worker.{name}.attack.request"),
            agent: format!("cryton_worker.{name}.agent.request"),
            control: format!("cryton_worker.{name}.control.request"),
        }
    }
}

/// Queues the hive consumes replies and worker events from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiveQueues {
    pub attack_response: String,
    pub agent_response: String,
    pub event_response: String,
}

impl Default for HiveQueues {
    fn default() -> Self {
        Self {
            attack_response: "cryton_hive.attack.response".to_string(),
            agent_response: "cryton_hive.agent.response".to_string(),
            event_response: "cryton_hive.event.response".to_string(),
        }
    }
}

impl HiveQueues {
    pub fn all(&self) -> [&str; 3] {
        [
            &self.attack_response,
            &self.agent_response,
            &self.event_response,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_queue_names() {
        let queues = WorkerQueues::for_worker("alpha");
        assert_eq!(queues.attack, "cryton_worker.alpha.attack.request");
        assert_eq!(queues.agent, "cryton_worker.alpha.agent.request");
        assert_eq!(queues.control, "cryton_worker.alpha.control.request");
    }
}
