use dashmap::DashMap;
use tracing::trace;

/// The default exchange routes a message straight to the queue named by its
/// routing key.
pub(crate) const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    // None matches every routing key (fanout)
    routing_key: Option<String>,
    queue_name: String,
}

/// Exchange binding table. Routing is the external trigger that creates
/// message instances: `BrokerService::publish` resolves target queues here,
/// then registers one message reference per queue it enqueues on.
#[derive(Debug, Default)]
pub(crate) struct ExchangeRouter {
    bindings: DashMap<String, Vec<Binding>>,
}

impl ExchangeRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a binding; returns false if it already exists.
    pub(crate) fn bind(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        queue_name: &str,
    ) -> bool {
        let binding = Binding {
            routing_key: routing_key.map(|key| key.to_string()),
            queue_name: queue_name.to_string(),
        };
        let mut bindings = self.bindings.entry(exchange.to_string()).or_default();
        if bindings.contains(&binding) {
            return false;
        }
        trace!(
            "bound queue {} to exchange '{}' (key {:?})",
            queue_name,
            exchange,
            routing_key
        );
        bindings.push(binding);
        true
    }

    /// Removes a binding; returns false if it was not present.
    pub(crate) fn unbind(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        queue_name: &str,
    ) -> bool {
        match self.bindings.get_mut(exchange) {
            Some(mut bindings) => {
                let before = bindings.len();
                bindings.retain(|binding| {
                    !(binding.queue_name == queue_name
                        && binding.routing_key.as_deref() == routing_key)
                });
                bindings.len() != before
            }
            None => false,
        }
    }

    /// Drops every binding that targets a deleted queue.
    pub(crate) fn drop_queue(&self, queue_name: &str) {
        for mut entry in self.bindings.iter_mut() {
            entry.value_mut().retain(|binding| binding.queue_name != queue_name);
        }
    }

    /// Resolves the target queues for a publish. Duplicate bindings to the
    /// same queue yield one instance, not two.
    pub(crate) fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return vec![routing_key.to_string()];
        }
        match self.bindings.get(exchange) {
            Some(bindings) => {
                let mut targets: Vec<String> = bindings
                    .iter()
                    .filter(|binding| match &binding.routing_key {
                        Some(bound_key) => bound_key == routing_key,
                        None => true,
                    })
                    .map(|binding| binding.queue_name.clone())
                    .collect();
                targets.sort();
                targets.dedup();
                targets
            }
            None => Vec::new(),
        }
    }
}
