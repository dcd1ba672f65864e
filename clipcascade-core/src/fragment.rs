use uuid::Uuid;

use crate::{
    CoreError, FragmentMetadata, LimitScope, PayloadKind, SealedEvent, WireEnvelope,
};

/// Upper bound on fragments per transfer, whatever the declared size.
const MAX_TOTAL_FRAGMENTS: usize = 1 << 16;
/// Envelope bytes a sealed payload can add on top of base64 growth.
const SEALED_OVERHEAD_BYTES: u64 = 256;

/// Splits `payload` into pieces of at most `max_fragment_bytes` bytes.
///
/// Cuts only on UTF-8 character boundaries, so a fragment may come out
/// shorter than the maximum. A single character wider than the maximum is
/// emitted whole. An empty payload yields one empty fragment.
pub fn split_utf8(payload: &str, max_fragment_bytes: usize) -> Vec<String> {
    let max = max_fragment_bytes.max(1);
    if payload.is_empty() {
        return vec![String::new()];
    }

    let mut fragments = Vec::with_capacity(payload.len().div_ceil(max));
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + max).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + payload[start..].chars().next().map_or(1, char::len_utf8);
        }
        fragments.push(payload[start..end].to_owned());
        start = end;
    }
    fragments
}

/// Serialized fragment sequence for one outbound payload, sent in index order.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    id: Uuid,
    frames: Vec<String>,
    next: usize,
}

impl OutboundTransfer {
    pub fn new(sealed: SealedEvent, max_fragment_bytes: usize) -> Result<Self, CoreError> {
        let id = Uuid::new_v4();
        let pieces = split_utf8(&sealed.payload, max_fragment_bytes);
        let total_fragments = pieces.len();
        let frames = pieces
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                WireEnvelope {
                    payload,
                    kind: sealed.kind,
                    metadata: Some(FragmentMetadata {
                        id,
                        is_fragmented: total_fragments > 1,
                        index,
                        total_fragments,
                        combined_raw_payload_size_in_bytes: sealed.raw_size,
                    }),
                }
                .encode()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            frames,
            next: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn total(&self) -> usize {
        self.frames.len()
    }

    pub fn sent(&self) -> usize {
        self.next
    }

    pub fn is_fragmented(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.frames.len()
    }

    pub fn next_frame(&mut self) -> Option<&str> {
        let frame = self.frames.get(self.next)?;
        self.next += 1;
        Some(frame.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    Pending { received: usize, total: usize },
    Complete { payload: String, kind: PayloadKind },
}

#[derive(Debug)]
struct FragmentBuffer {
    transfer_id: Uuid,
    kind: PayloadKind,
    slots: Vec<Option<String>>,
}

impl FragmentBuffer {
    fn new(metadata: &FragmentMetadata, kind: PayloadKind) -> Self {
        Self {
            transfer_id: metadata.id,
            kind,
            slots: vec![None; metadata.total_fragments],
        }
    }

    fn accepts(&self, metadata: &FragmentMetadata) -> bool {
        self.transfer_id == metadata.id && self.slots.len() == metadata.total_fragments
    }

    fn received(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.is_none().then_some(index))
            .collect()
    }
}

/// Inbound reassembly for one direction: at most one transfer in flight.
///
/// A fragment carrying a different transfer id discards whatever was being
/// collected. Arrival of the last index with empty slots aborts the transfer.
#[derive(Debug, Default)]
pub struct Reassembler {
    local_limit: Option<u64>,
    buffer: Option<FragmentBuffer>,
}

impl Reassembler {
    pub fn new(local_limit: Option<u64>) -> Self {
        Self {
            local_limit,
            buffer: None,
        }
    }

    pub fn reset(&mut self) {
        self.buffer = None;
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_none()
    }

    /// `(received, total)` of the transfer being collected.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.buffer
            .as_ref()
            .map(|buffer| (buffer.received(), buffer.slots.len()))
    }

    pub fn accept(&mut self, envelope: WireEnvelope) -> Result<Reassembly, CoreError> {
        let WireEnvelope {
            payload,
            kind,
            metadata,
        } = envelope;

        let Some(metadata) = metadata else {
            self.reset();
            return Ok(Reassembly::Complete { payload, kind });
        };

        if let Some(limit) = self.local_limit
            && metadata.combined_raw_payload_size_in_bytes > limit
        {
            self.reset();
            return Err(CoreError::SizeLimitExceeded {
                size: metadata.combined_raw_payload_size_in_bytes,
                limit,
                scope: LimitScope::Local,
            });
        }

        if !metadata.is_fragmented {
            self.reset();
            return Ok(Reassembly::Complete { payload, kind });
        }

        if metadata.total_fragments == 0 || metadata.index >= metadata.total_fragments {
            return Err(CoreError::InvalidFragment(format!(
                "index {} outside 0..{}",
                metadata.index, metadata.total_fragments
            )));
        }
        let allowed = max_fragments_for(metadata.combined_raw_payload_size_in_bytes);
        if metadata.total_fragments > allowed {
            return Err(CoreError::InvalidFragment(format!(
                "{} fragments declared for {} bytes, at most {allowed} possible",
                metadata.total_fragments, metadata.combined_raw_payload_size_in_bytes
            )));
        }

        if self
            .buffer
            .as_ref()
            .is_some_and(|buffer| !buffer.accepts(&metadata))
        {
            self.buffer = None;
        }
        let buffer = self
            .buffer
            .get_or_insert_with(|| FragmentBuffer::new(&metadata, kind));
        buffer.slots[metadata.index] = Some(payload);

        if metadata.index + 1 < metadata.total_fragments {
            return Ok(Reassembly::Pending {
                received: buffer.received(),
                total: metadata.total_fragments,
            });
        }

        let Some(buffer) = self.buffer.take() else {
            return Err(CoreError::InvalidFragment("no transfer in progress".to_owned()));
        };
        let missing = buffer.missing();
        if !missing.is_empty() {
            return Err(CoreError::Fragmentation {
                transfer_id: buffer.transfer_id.to_string(),
                missing,
            });
        }
        let payload = buffer.slots.into_iter().flatten().collect::<String>();
        Ok(Reassembly::Complete {
            payload,
            kind: buffer.kind,
        })
    }
}

/// Every fragment but a lone empty one carries at least one byte of the
/// sealed payload, which is at most twice the raw size plus the envelope.
fn max_fragments_for(raw_size: u64) -> usize {
    let sealed_upper = raw_size
        .saturating_mul(2)
        .saturating_add(SEALED_OVERHEAD_BYTES);
    usize::try_from(sealed_upper)
        .unwrap_or(usize::MAX)
        .min(MAX_TOTAL_FRAGMENTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(payload: &str) -> SealedEvent {
        SealedEvent {
            kind: PayloadKind::Text,
            payload: payload.to_owned(),
            raw_size: payload.len() as u64,
        }
    }

    fn frames(payload: &str, max: usize) -> Vec<WireEnvelope> {
        let mut transfer = OutboundTransfer::new(sealed(payload), max).unwrap();
        let mut out = Vec::new();
        while let Some(frame) = transfer.next_frame() {
            out.push(WireEnvelope::decode(frame).unwrap());
        }
        out
    }

    fn reassemble(reassembler: &mut Reassembler, envelopes: Vec<WireEnvelope>) -> Reassembly {
        let mut last = None;
        for envelope in envelopes {
            last = Some(reassembler.accept(envelope).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn split_respects_exact_multiples() {
        let payload = "abcdefghijkl";
        let pieces = split_utf8(payload, 4);
        assert_eq!(pieces, vec!["abcd", "efgh", "ijkl"]);
        assert_eq!(pieces.concat(), payload);
    }

    #[test]
    fn split_never_cuts_a_code_point() {
        // "é" is two bytes; a 3-byte limit would land inside the second one.
        let payload = "éé€x";
        let pieces = split_utf8(payload, 3);
        assert_eq!(pieces, vec!["é", "é", "€", "x"]);
        assert!(pieces.iter().all(|piece| piece.len() <= 3));
        assert_eq!(pieces.concat(), payload);
    }

    #[test]
    fn split_emits_oversized_character_whole() {
        let pieces = split_utf8("a😀b", 2);
        assert_eq!(pieces, vec!["a", "😀", "b"]);
    }

    #[test]
    fn split_of_empty_payload_is_one_fragment() {
        assert_eq!(split_utf8("", 8), vec![String::new()]);
    }

    #[test]
    fn fragmented_roundtrip() {
        let payload = "The quick brown fox jumps over the lazy dog, ünïcödé ✓".repeat(7);
        let envelopes = frames(&payload, 16);
        assert!(envelopes.len() > 1);
        let first = envelopes[0].metadata.as_ref().unwrap();
        assert!(first.is_fragmented);
        assert_eq!(first.total_fragments, envelopes.len());

        let mut reassembler = Reassembler::new(None);
        match reassemble(&mut reassembler, envelopes) {
            Reassembly::Complete { payload: out, kind } => {
                assert_eq!(out, payload);
                assert_eq!(kind, PayloadKind::Text);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reassembler.is_idle());
    }

    #[test]
    fn small_payload_is_single_unfragmented_frame() {
        let envelopes = frames("tiny", 1024);
        assert_eq!(envelopes.len(), 1);
        assert!(!envelopes[0].metadata.as_ref().unwrap().is_fragmented);
        let mut reassembler = Reassembler::new(None);
        assert_eq!(
            reassemble(&mut reassembler, envelopes),
            Reassembly::Complete {
                payload: "tiny".to_owned(),
                kind: PayloadKind::Text
            }
        );
    }

    #[test]
    fn pending_reports_progress() {
        let mut envelopes = frames("aaaabbbbcccc", 4);
        let mut reassembler = Reassembler::new(None);
        let first = reassembler.accept(envelopes.remove(0)).unwrap();
        assert_eq!(
            first,
            Reassembly::Pending {
                received: 1,
                total: 3
            }
        );
        assert_eq!(reassembler.progress(), Some((1, 3)));
    }

    #[test]
    fn missing_fragment_aborts_on_last_index() {
        let mut envelopes = frames("aaaabbbbcccc", 4);
        envelopes.remove(1);
        let mut reassembler = Reassembler::new(None);
        reassembler.accept(envelopes.remove(0)).unwrap();
        let err = reassembler.accept(envelopes.remove(0)).unwrap_err();
        match err {
            CoreError::Fragmentation { missing, .. } => assert_eq!(missing, vec![1]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(reassembler.is_idle());
    }

    #[test]
    fn new_transfer_id_discards_incomplete_buffer() {
        let mut stale = frames("xxxxyyyyzzzz", 4);
        let fresh = frames("11112222", 4);
        let mut reassembler = Reassembler::new(None);
        reassembler.accept(stale.remove(0)).unwrap();
        match reassemble(&mut reassembler, fresh) {
            Reassembly::Complete { payload, .. } => assert_eq!(payload, "11112222"),
            other => panic!("unexpected {other:?}"),
        }
        // The rest of the stale transfer starts a new buffer and aborts.
        reassembler.accept(stale.remove(0)).unwrap();
        assert!(matches!(
            reassembler.accept(stale.remove(0)),
            Err(CoreError::Fragmentation { .. })
        ));
    }

    #[test]
    fn size_limit_rejects_before_buffering_then_accepts_smaller() {
        let mut reassembler = Reassembler::new(Some(10));
        let oversized = frames("0123456789abcdef", 4);
        for envelope in oversized {
            assert!(matches!(
                reassembler.accept(envelope),
                Err(CoreError::SizeLimitExceeded {
                    scope: LimitScope::Local,
                    ..
                })
            ));
            assert!(reassembler.is_idle());
        }

        let small = frames("01234567", 4);
        match reassemble(&mut reassembler, small) {
            Reassembly::Complete { payload, .. } => assert_eq!(payload, "01234567"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut envelope = frames("aaaabbbb", 4).remove(0);
        if let Some(metadata) = envelope.metadata.as_mut() {
            metadata.index = 9;
        }
        let mut reassembler = Reassembler::new(None);
        assert!(matches!(
            reassembler.accept(envelope),
            Err(CoreError::InvalidFragment(_))
        ));
    }

    fn hostile(total_fragments: u64, raw_size: u64) -> WireEnvelope {
        WireEnvelope::decode(&format!(
            r#"{{"payload":"x","type":"text","metadata":{{"id":"6f1c1a52-3c1e-4d55-9a57-0d7f43b6a0e1","isFragmented":true,"index":0,"totalFragments":{total_fragments},"combinedRawPayloadSizeInBytes":{raw_size}}}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn implausible_fragment_count_is_rejected_without_buffering() {
        let mut reassembler = Reassembler::new(None);
        let mut pending = frames("aaaabbbbcccc", 4);
        reassembler.accept(pending.remove(0)).unwrap();

        for envelope in [
            hostile(1_152_921_504_606_846_975, 10),
            hostile(1_152_921_504_606_846_975, u64::MAX),
            hostile(300, 10),
        ] {
            assert!(matches!(
                reassembler.accept(envelope),
                Err(CoreError::InvalidFragment(_))
            ));
        }

        // The transfer already in progress is unaffected.
        assert_eq!(reassembler.progress(), Some((1, 3)));
        match reassemble(&mut reassembler, pending) {
            Reassembly::Complete { payload, .. } => assert_eq!(payload, "aaaabbbbcccc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fragment_bound_covers_encrypted_payloads() {
        assert_eq!(max_fragments_for(0), 256);
        assert_eq!(max_fragments_for(1_000), 2_256);
        assert_eq!(max_fragments_for(u64::MAX), MAX_TOTAL_FRAGMENTS);
    }
}
