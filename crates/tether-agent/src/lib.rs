pub mod artifact;
pub mod bridge_service;
pub mod chunking;
pub mod config;
pub mod engine_installation;
pub mod engine_lock;
pub mod engine_manager;
pub mod engine_process;
pub mod installer;
pub mod job_error;
pub mod launch;
pub mod port_alloc;
pub mod reattach;
pub mod session_controller;
pub mod session_factory;
pub mod signal;
pub mod topic_client;
