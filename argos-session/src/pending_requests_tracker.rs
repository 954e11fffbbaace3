use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use argos_core::{CaptureRequest, HalStream, StreamBuffer};

use crate::SessionError;

/// Délai maximal d'attente d'un budget de buffers
const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Default)]
struct TrackerState {
    /// Buffers demandés et non encore rendus, par flux
    pending: HashMap<i32, u32>,

    /// Buffers acquis auprès du framework et non rendus, par flux
    acquired: HashMap<i32, u32>,
}

/// Comptabilité des buffers en vol, active quand le dispositif supporte la
/// gestion de buffers par le HAL.
///
/// L'admission d'une requête bloque sur la variable de condition tant que le
/// budget d'un de ses flux (le `max_buffers` choisi par le HAL) est épuisé.
pub struct PendingRequestsTracker {
    /// Budget par flux, fixé à la configuration
    max_buffers: HashMap<i32, u32>,

    state: Mutex<TrackerState>,
    condvar: Condvar,
}

impl PendingRequestsTracker {
    pub fn new(hal_streams: &[HalStream]) -> Arc<Self> {
        let max_buffers = hal_streams
            .iter()
            .map(|hal_stream| (hal_stream.id, hal_stream.max_buffers))
            .collect();

        Arc::new(Self {
            max_buffers,
            state: Mutex::new(TrackerState::default()),
            condvar: Condvar::new(),
        })
    }

    fn request_stream_ids(&self, request: &CaptureRequest) -> Vec<i32> {
        let mut stream_ids = HashSet::new();
        for buffer in &request.output_buffers {
            if self.max_buffers.contains_key(&buffer.stream_id) {
                stream_ids.insert(buffer.stream_id);
            } else {
                warn!(
                    "Trame {}: flux {} hors budget, ignoré par le traqueur",
                    request.frame_number, buffer.stream_id
                );
            }
        }
        stream_ids.into_iter().collect()
    }

    /// Bloque jusqu'à ce que chaque flux de la requête dispose de budget,
    /// puis comptabilise les buffers demandés
    pub fn wait_and_track_request_buffers(
        &self,
        request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        let stream_ids = self.request_stream_ids(request);
        let mut state = self.state.lock();

        loop {
            let exhausted = stream_ids.iter().find(|stream_id| {
                let pending = state.pending.get(stream_id).copied().unwrap_or(0);
                pending >= self.max_buffers[stream_id]
            });

            match exhausted {
                None => break,
                Some(&stream_id) => {
                    let timed_out = self
                        .condvar
                        .wait_for(&mut state, WAIT_TIMEOUT)
                        .timed_out();
                    if timed_out {
                        return Err(SessionError::TimedOut(format!(
                            "Trame {}: budget du flux {} épuisé",
                            request.frame_number, stream_id
                        )));
                    }
                }
            }
        }

        for buffer in &request.output_buffers {
            if self.max_buffers.contains_key(&buffer.stream_id) {
                *state.pending.entry(buffer.stream_id).or_insert(0) += 1;
            }
        }

        Ok(())
    }

    /// Crédite les buffers rendus par un résultat
    pub fn track_returned_result_buffers(&self, returned: &[StreamBuffer]) {
        let mut state = self.state.lock();
        for buffer in returned {
            match state.pending.get_mut(&buffer.stream_id) {
                Some(count) if *count > 0 => *count -= 1,
                _ => warn!(
                    "Retour non comptabilisé pour le flux {}",
                    buffer.stream_id
                ),
            }
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Bloque jusqu'à ce que le quota d'acquisition du flux libère `count`
    /// places, puis comptabilise l'acquisition (chemin request_stream_buffers)
    pub fn wait_and_track_acquired_buffers(
        &self,
        stream_id: i32,
        count: u32,
    ) -> Result<(), SessionError> {
        let quota = *self.max_buffers.get(&stream_id).ok_or_else(|| {
            SessionError::NotFound(format!("Flux {} sans budget d'acquisition", stream_id))
        })?;

        let mut state = self.state.lock();
        loop {
            let acquired = state.acquired.get(&stream_id).copied().unwrap_or(0);
            if acquired + count <= quota {
                break;
            }
            let timed_out = self.condvar.wait_for(&mut state, WAIT_TIMEOUT).timed_out();
            if timed_out {
                return Err(SessionError::TimedOut(format!(
                    "Quota d'acquisition du flux {} épuisé",
                    stream_id
                )));
            }
        }

        *state.acquired.entry(stream_id).or_insert(0) += count;
        Ok(())
    }

    /// Crédite des buffers acquis rendus au framework
    pub fn track_returned_acquired_buffers(&self, returned: &[StreamBuffer]) {
        let mut state = self.state.lock();
        for buffer in returned {
            match state.acquired.get_mut(&buffer.stream_id) {
                Some(count) if *count > 0 => *count -= 1,
                _ => warn!(
                    "Retour d'acquisition non comptabilisé pour le flux {}",
                    buffer.stream_id
                ),
            }
        }
        drop(state);
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_hal_stream(id: i32, max_buffers: u32) -> HalStream {
        HalStream {
            id,
            max_buffers,
            ..Default::default()
        }
    }

    fn make_request(frame_number: u32, stream_id: i32) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            output_buffers: vec![StreamBuffer {
                stream_id,
                buffer_id: frame_number as u64,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_budget_blocks_then_releases() {
        let tracker = PendingRequestsTracker::new(&[make_hal_stream(0, 2)]);

        tracker
            .wait_and_track_request_buffers(&make_request(1, 0))
            .unwrap();
        tracker
            .wait_and_track_request_buffers(&make_request(2, 0))
            .unwrap();

        // Budget épuisé: un autre thread libère après un court délai
        let tracker_clone = tracker.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            tracker_clone.track_returned_result_buffers(&[StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }]);
        });

        tracker
            .wait_and_track_request_buffers(&make_request(3, 0))
            .unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn test_budget_timeout() {
        let tracker = PendingRequestsTracker::new(&[make_hal_stream(0, 1)]);
        tracker
            .wait_and_track_request_buffers(&make_request(1, 0))
            .unwrap();

        let result = tracker.wait_and_track_request_buffers(&make_request(2, 0));
        assert!(matches!(result, Err(SessionError::TimedOut(_))));
    }

    #[test]
    fn test_acquisition_quota() {
        let tracker = PendingRequestsTracker::new(&[make_hal_stream(4, 2)]);
        tracker.wait_and_track_acquired_buffers(4, 2).unwrap();
        assert!(tracker.wait_and_track_acquired_buffers(4, 1).is_err());

        tracker.track_returned_acquired_buffers(&[StreamBuffer {
            stream_id: 4,
            buffer_id: 9,
            ..Default::default()
        }]);
        tracker.wait_and_track_acquired_buffers(4, 1).unwrap();
    }

    #[test]
    fn test_unknown_stream_ignored() {
        let tracker = PendingRequestsTracker::new(&[make_hal_stream(0, 1)]);
        // Le flux 9 n'a pas de budget: la requête passe sans blocage
        tracker
            .wait_and_track_request_buffers(&make_request(1, 9))
            .unwrap();
        tracker
            .wait_and_track_request_buffers(&make_request(2, 9))
            .unwrap();
    }
}
