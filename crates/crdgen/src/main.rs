use kube::CustomResourceExt as _;
use pg_cluster::api::v1::{pgcluster::PgCluster, pgreplica::PgReplica, pgtask::PgTask};

fn main() {
    print!("{}", serde_yaml::to_string(&PgCluster::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&PgReplica::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&PgTask::crd()).unwrap());
}
