#[cfg(test)]
mod tests {
    use crate::api::v1::{PgCluster, PgClusterSpec, StrategyVersion};
    use crate::controllers::cluster_controller::State;
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::api::{Api, ObjectMeta, Patch, PatchParams};
    use kube::Client;

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_reconcile_should_set_status() {
        let client = Client::try_default().await.unwrap();
        let ctx = State::default().to_context(client.clone());

        // Create a test PgCluster
        let pg_cluster = PgCluster {
            metadata: ObjectMeta {
                name: Some("test-cluster".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: PgClusterSpec {
                postgres_image_tag: "rocky8-16.4-1.2.0".to_string(),
                strategy: StrategyVersion::V1,
                replicas: 0,
                ..Default::default()
            },
            status: None,
        };

        let clusters: Api<PgCluster> = Api::namespaced(client.clone(), "default");
        let ssapply = PatchParams::apply("ctrltest").force();
        let patch = Patch::Apply(&pg_cluster);
        clusters.patch("test-cluster", &ssapply, &patch).await.unwrap();

        // First pass records the cluster, second pass provisions it
        pg_cluster.reconcile(ctx.clone()).await.unwrap();
        let recorded = clusters.get("test-cluster").await.unwrap();
        assert!(recorded.status.is_some());

        recorded.reconcile(ctx).await.unwrap();

        // Check that the primary deployment and the repo deployment exist
        let deployment_client: Api<Deployment> = Api::namespaced(client.clone(), "default");
        let primary = deployment_client.get("test-cluster").await.unwrap();
        assert_eq!(primary.metadata.name.as_deref(), Some("test-cluster"));
        deployment_client.get("test-cluster-backrest-shared-repo").await.unwrap();

        delete_cluster("test-cluster").await;
    }

    async fn delete_cluster(name: &str) {
        let client = Client::try_default().await.unwrap();
        let clusters: Api<PgCluster> = Api::namespaced(client.clone(), "default");
        clusters.delete(name, &Default::default()).await.unwrap();
    }
}
