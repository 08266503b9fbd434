pub mod consistency;
pub mod deletion_service;
pub mod ingestion_service;
pub mod metadata_repository;
pub mod notification_worker;
pub mod object_store;
pub mod queue_client;
pub mod transport;
pub mod validation;

#[cfg(test)]
pub mod mock_clients;
