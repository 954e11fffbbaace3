/// Poignée opaque vers un buffer graphique natif. La valeur brute n'est
/// jamais interprétée par le moteur de session, seulement transportée entre
/// l'allocateur, les blocs et le framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    /// Valeur native opaque
    pub raw: u64,
}

impl BufferHandle {
    pub fn new(raw: u64) -> Self {
        Self { raw }
    }
}

/// Objet de synchronisation opaque (équivalent d'un descripteur de fence).
/// Le moteur le traite comme un signal à attendre, jamais comme une valeur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    /// Descripteur natif opaque
    pub raw: i32,
}

/// État d'un buffer au retour d'un résultat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

impl Default for BufferStatus {
    fn default() -> Self {
        BufferStatus::Ok
    }
}

/// Buffer attaché à un flux dans une requête ou un résultat.
///
/// La propriété du handle natif passe de l'appelant à l'appelé à la
/// soumission et revient à la complétion. Au sein d'une même requête un
/// handle n'apparaît qu'une fois par flux.
#[derive(Debug, Clone, Default)]
pub struct StreamBuffer {
    /// Identifiant du flux auquel ce buffer appartient
    pub stream_id: i32,

    /// Identité du buffer choisie par le producteur. Un même handle natif
    /// peut apparaître sous plusieurs identités au fil des requêtes.
    pub buffer_id: u64,

    /// Handle natif, absent pour un buffer à résoudre par le gestionnaire
    /// de buffers du HAL
    pub buffer: Option<BufferHandle>,

    /// État du buffer
    pub status: BufferStatus,

    /// Fence d'acquisition: à attendre avant d'écrire ou de lire
    pub acquire_fence: Option<Fence>,

    /// Fence de libération: signalée quand le producteur a terminé
    pub release_fence: Option<Fence>,
}

impl StreamBuffer {
    /// Construit un buffer en erreur pour un flux donné, utilisé lors des
    /// rapports d'échec par requête
    pub fn errored(stream_id: i32, buffer_id: u64) -> Self {
        Self {
            stream_id,
            buffer_id,
            buffer: None,
            status: BufferStatus::Error,
            acquire_fence: None,
            release_fence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errored_buffer() {
        let buffer = StreamBuffer::errored(3, 17);
        assert_eq!(buffer.stream_id, 3);
        assert_eq!(buffer.buffer_id, 17);
        assert_eq!(buffer.status, BufferStatus::Error);
        assert!(buffer.buffer.is_none());
    }
}
