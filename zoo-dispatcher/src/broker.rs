use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use crate::config::{RabbitHost, RabbitSettings};

pub async fn connect(host: &RabbitHost) -> Result<Connection, lapin::Error> {
    let uri = host.amqp_uri();
    info!(server = %host.server, port = host.port, vhost = %host.vhost, "connecting to broker");
    Connection::connect(&uri, ConnectionProperties::default()).await
}

/// Declare the exchange, both queues, and their binds. Idempotent against a
/// broker that already carries the topology.
pub async fn declare_topology(
    channel: &Channel,
    settings: &RabbitSettings,
) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            &settings.exchange.name,
            exchange_kind(&settings.exchange.kind),
            ExchangeDeclareOptions {
                durable: settings.exchange.durable,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    for queue in [&settings.workqueue, &settings.resultsqueue] {
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &queue.name,
                &settings.exchange.name,
                &queue.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(
            queue = %queue.name,
            routing_key = %queue.routing_key,
            "queue declared and bound"
        );
    }

    Ok(())
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind("topic"), ExchangeKind::Topic);
        assert_eq!(exchange_kind("direct"), ExchangeKind::Direct);
        assert_eq!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }
}
