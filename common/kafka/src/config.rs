use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64, // Upper bound on a single partition discovery request
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    // Only used to identify the client to the brokers, since partitions are assigned
    // manually and offsets are never committed.
    #[envconfig(default = "balance-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

impl ConsumerConfig {
    /// Subscriptions start at the oldest retained offset unless explicitly told otherwise.
    pub fn start_from_latest(&self) -> bool {
        self.kafka_consumer_offset_reset.eq_ignore_ascii_case("latest")
    }
}
