pub mod intent_service;
