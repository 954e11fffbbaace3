use std::sync::Arc;

use parking_lot::Mutex;

use argos_core::{CaptureRequest, StreamConfiguration};

use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{ProcessBlock, ProcessBlockRequest};
use crate::request_processor::RequestProcessor;
use crate::SessionError;

/// Processeur de requêtes à passage direct: chaque requête de capture
/// devient une unique requête de bloc, sans flux interne.
pub struct BasicRequestProcessor {
    process_block: Mutex<Option<Box<dyn ProcessBlock>>>,
    configured: Mutex<bool>,
}

impl BasicRequestProcessor {
    pub fn new() -> Self {
        Self {
            process_block: Mutex::new(None),
            configured: Mutex::new(false),
        }
    }
}

impl Default for BasicRequestProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestProcessor for BasicRequestProcessor {
    fn configure_streams(
        &self,
        _internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let mut configured = self.configured.lock();
        if *configured {
            return Err(SessionError::AlreadyExists(
                "Processeur de base déjà configuré".to_string(),
            ));
        }
        *configured = true;
        Ok(stream_config.clone())
    }

    fn set_process_block(&self, process_block: Box<dyn ProcessBlock>) -> Result<(), SessionError> {
        let mut slot = self.process_block.lock();
        if slot.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc de traitement déjà installé".to_string(),
            ));
        }
        *slot = Some(process_block);
        Ok(())
    }

    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        let process_block = self.process_block.lock();
        let process_block = process_block
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc de traitement absent".to_string()))?;

        let block_request = ProcessBlockRequest {
            request_id: 0,
            request: request.clone(),
        };
        process_block.process_requests(std::slice::from_ref(&block_request), request)
    }

    fn flush(&self) -> Result<(), SessionError> {
        match self.process_block.lock().as_ref() {
            Some(process_block) => process_block.flush(),
            None => Ok(()),
        }
    }
}
