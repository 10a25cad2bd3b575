pub mod filter;
pub mod sample;
pub mod series;

/// Topic filter the monitor subscribes to on the broker
pub const MQTT_TOPIC_FILTER: &str = "medical/ctg/+/+";

/// Default endpoints (usable for local development)
pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_GRPC_LISTEN: &str = "0.0.0.0:50051";
pub const DEFAULT_ADMIN_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_EXPORT_TARGET: &str = "http://localhost:50052";
