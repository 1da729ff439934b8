use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 9] = [
    QUEUE_MESSAGES_IN_TOTAL,
    QUEUE_MESSAGES_DELIVERED_TOTAL,
    QUEUE_MESSAGES_ACKED_TOTAL,
    QUEUE_MESSAGES_REQUEUED_TOTAL,
    QUEUE_MESSAGES_DEAD_LETTERED_TOTAL,
    QUEUE_MESSAGES_EXPIRED_TOTAL,
    QUEUE_MESSAGES_UNROUTABLE_TOTAL,
    CONSUMER_MESSAGES_OUT_TOTAL,
    CONSUMER_BYTES_OUT_TOTAL,
];
pub(crate) const GAUGES: [Metric; 4] = [
    QUEUE_AVAILABLE_MESSAGES,
    QUEUE_OUTSTANDING_DELIVERIES,
    QUEUE_ACTIVE_CONSUMERS,
    BROKER_LIVE_REFERENCES,
];
pub(crate) const HISTOGRAMS: [Metric; 1] = [QUEUE_MESSAGE_SIZE_BYTES];

// QUEUE Metrics --------------------------

pub(crate) const QUEUE_MESSAGES_IN_TOTAL: Metric = Metric {
    name: "sava_queue_messages_in_total",
    description: "Total messages enqueued on the queue (msg).",
};

pub(crate) const QUEUE_MESSAGES_DELIVERED_TOTAL: Metric = Metric {
    name: "sava_queue_messages_delivered_total",
    description: "Total messages handed to consumers (msg).",
};

pub(crate) const QUEUE_MESSAGES_ACKED_TOTAL: Metric = Metric {
    name: "sava_queue_messages_acked_total",
    description: "Total messages acknowledged by consumers (msg).",
};

pub(crate) const QUEUE_MESSAGES_REQUEUED_TOTAL: Metric = Metric {
    name: "sava_queue_messages_requeued_total",
    description: "Total messages returned to the queue after a rejected or abandoned delivery",
};

pub(crate) const QUEUE_MESSAGES_DEAD_LETTERED_TOTAL: Metric = Metric {
    name: "sava_queue_messages_dead_lettered_total",
    description: "Total messages removed with a terminal dead-letter disposition",
};

pub(crate) const QUEUE_MESSAGES_EXPIRED_TOTAL: Metric = Metric {
    name: "sava_queue_messages_expired_total",
    description: "Total messages expired past their deadline",
};

pub(crate) const QUEUE_MESSAGES_UNROUTABLE_TOTAL: Metric = Metric {
    name: "sava_queue_messages_unroutable_total",
    description: "Total published messages that matched no queue binding",
};

pub(crate) const QUEUE_MESSAGE_SIZE_BYTES: Metric = Metric {
    name: "sava_queue_message_size_bytes",
    description: "Distribution of published message sizes (bytes)",
};

pub(crate) const QUEUE_AVAILABLE_MESSAGES: Metric = Metric {
    name: "sava_queue_available_messages",
    description: "Messages currently visible to the dispatch engine per queue",
};

pub(crate) const QUEUE_OUTSTANDING_DELIVERIES: Metric = Metric {
    name: "sava_queue_outstanding_deliveries",
    description: "Deliveries awaiting consumer settlement per queue",
};

pub(crate) const QUEUE_ACTIVE_CONSUMERS: Metric = Metric {
    name: "sava_queue_active_consumers",
    description: "Total number of active consumers per queue",
};

// BROKER Metrics --------------------------

pub(crate) const BROKER_LIVE_REFERENCES: Metric = Metric {
    name: "sava_broker_live_references",
    description: "Live message references across all queues; nonzero at idle indicates a leak",
};

// CONSUMER Metrics --------------------------

pub(crate) const CONSUMER_MESSAGES_OUT_TOTAL: Metric = Metric {
    name: "sava_consumer_messages_out_total",
    description: "Total messages delivered to consumer (msg).",
};

pub(crate) const CONSUMER_BYTES_OUT_TOTAL: Metric = Metric {
    name: "sava_consumer_bytes_out_total",
    description: "Total bytes delivered to consumer (bytes)",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>, cluster_name: &str) {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("cluster", cluster_name.to_string())
            .install()
            .expect("failed to install Prometheus recorder");
    }

    for name in COUNTERS {
        register_counter(name)
    }

    for name in GAUGES {
        register_gauge(name)
    }

    for name in HISTOGRAMS {
        register_histogram(name)
    }
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

/// Registers a histogram with the given name.
fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}
