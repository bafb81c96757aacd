use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

pub struct Metrics {
    registry: Registry,
    deploys: Family<OutcomeLabels, Counter>,
    builds_triggered: Counter,
    webhook_events: Counter,
    status_queries: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("portal");
        let deploys = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "deploys",
            "Deploy controller operations by outcome",
            deploys.clone(),
        );
        let builds_triggered = Counter::default();
        registry.register(
            "builds_triggered",
            "Build jobs submitted to the cluster",
            builds_triggered.clone(),
        );
        let webhook_events = Counter::default();
        registry.register(
            "webhook_events",
            "Push events received on the webhook intake",
            webhook_events.clone(),
        );
        let status_queries = Counter::default();
        registry.register(
            "status_queries",
            "Workload status queries served",
            status_queries.clone(),
        );
        Self {
            registry,
            deploys,
            builds_triggered,
            webhook_events,
            status_queries,
        }
    }

    pub fn deploy_inc(&self, outcome: &str) {
        self.deploys
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn build_triggered_inc(&self) {
        self.builds_triggered.inc();
    }

    pub fn webhook_event_inc(&self) {
        self.webhook_events.inc();
    }

    pub fn status_query_inc(&self) {
        self.status_queries.inc();
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_encoding() {
        let metrics = Metrics::new();
        metrics.deploy_inc("created");
        metrics.build_triggered_inc();
        metrics.webhook_event_inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("portal_deploys_total"));
        assert!(text.contains("outcome=\"created\""));
        assert!(text.contains("portal_builds_triggered_total 1"));
    }
}
