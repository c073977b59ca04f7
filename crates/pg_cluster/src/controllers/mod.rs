pub mod cluster_controller;
pub mod replica_controller;
pub mod task_controller;
