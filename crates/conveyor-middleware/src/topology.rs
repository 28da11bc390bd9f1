// Exchange and queue layout shared by every worker.
// Replica `i` of a stage reads `<base>-<i>`, bound to its exchange under its own name.
use crate::Result;
use crate::transport::Transport;

pub fn queue_name(base: &str, index: usize) -> String {
    format!("{base}-{index}")
}

pub fn queue_names(base: &str, copies: usize) -> Vec<String> {
    (0..copies).map(|index| queue_name(base, index)).collect()
}

/// Declares the input queue of replica `id` and binds it; returns its name.
pub async fn declare_input(
    transport: &dyn Transport,
    exchange: &str,
    queue_base: &str,
    id: usize,
) -> Result<String> {
    transport.declare_exchange(exchange).await?;
    let queue = queue_name(queue_base, id);
    transport.declare_queue(&queue).await?;
    transport.bind_queue(&queue, &queue, exchange).await?;
    tracing::debug!(exchange, queue = %queue, "input declared");
    Ok(queue)
}

/// Declares every downstream replica queue of `queue_base` on `exchange`.
pub async fn declare_output(
    transport: &dyn Transport,
    exchange: &str,
    queue_base: &str,
    copies: usize,
) -> Result<()> {
    transport.declare_exchange(exchange).await?;
    for queue in queue_names(queue_base, copies) {
        transport.declare_queue(&queue).await?;
        transport.bind_queue(&queue, &queue, exchange).await?;
    }
    tracing::debug!(exchange, queue_base, copies, "output declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use bytes::Bytes;
    use conveyor_broker::Broker;
    use conveyor_common::HeaderTable;
    use std::sync::Arc;

    #[test]
    fn names_are_indexed() {
        assert_eq!(queue_names("top", 3), vec!["top-0", "top-1", "top-2"]);
        assert!(queue_names("top", 0).is_empty());
    }

    #[tokio::test]
    async fn output_queues_receive_by_name() {
        let broker = Arc::new(Broker::new());
        let transport = InProcessTransport::new(Arc::clone(&broker));
        declare_output(&transport, "movies", "filter", 2)
            .await
            .expect("output");
        let queue = declare_input(&transport, "movies", "filter", 1)
            .await
            .expect("input");
        assert_eq!(queue, "filter-1");

        transport
            .publish("movies", "filter-1", HeaderTable::new(), Bytes::new())
            .await
            .expect("publish");
        assert_eq!(broker.queue_depth("filter-1").await.expect("depth").ready, 1);
        assert_eq!(broker.queue_depth("filter-0").await.expect("depth").ready, 0);
    }
}
