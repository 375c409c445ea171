use feedwatch_shared::{seq_less_than, seq_next, SequenceNumber, UpdateMsg};

/// What became of a sequence-numbered message handed to the tracker.
#[derive(Debug)]
pub(crate) enum GapOutcome {
    /// In-order messages ready for delivery, gap-filling included.
    Deliver(Vec<UpdateMsg>),
    /// Out-of-order message buffered while the gap stays open.
    Buffered,
    /// Duplicate or stale message; dropped silently.
    Stale,
    /// The gap outgrew the buffer window; the stream must be re-requested.
    /// Buffered messages beyond the window have been discarded.
    Resync,
}

/// Per-stream sequence bookkeeping for loss detection.
///
/// Messages arriving in order pass straight through. A message that jumps
/// ahead opens a gap: it is held, in sequence order, until either the gap
/// closes (everything drains in order) or the buffer outgrows the window
/// and the stream has to be recovered by re-requesting it.
pub(crate) struct GapTracker {
    last: Option<SequenceNumber>,
    buffer: Vec<(SequenceNumber, UpdateMsg)>,
    window: usize,
    resync_pending: bool,
}

impl GapTracker {
    pub fn new(window: usize) -> Self {
        Self {
            last: None,
            buffer: Vec::new(),
            window,
            resync_pending: false,
        }
    }

    /// Re-anchors the tracker at a refresh's sequence number, dropping any
    /// buffered fragments of the previous image.
    pub fn baseline(&mut self, seq: Option<SequenceNumber>) {
        self.last = seq;
        self.buffer.clear();
        self.resync_pending = false;
    }

    pub fn on_update(&mut self, msg: UpdateMsg) -> GapOutcome {
        if self.resync_pending {
            // a re-request is in flight; interim traffic belongs to the
            // abandoned image
            return GapOutcome::Stale;
        }
        let Some(seq) = msg.seq_num else {
            // not a sequenced stream; pass through
            return GapOutcome::Deliver(vec![msg]);
        };

        let Some(last) = self.last else {
            self.last = Some(seq);
            return GapOutcome::Deliver(vec![msg]);
        };

        if seq == seq_next(last) {
            self.last = Some(seq);
            let mut ready = vec![msg];
            self.drain_contiguous(&mut ready);
            return GapOutcome::Deliver(ready);
        }

        if !seq_less_than(last, seq) {
            return GapOutcome::Stale;
        }

        // gap: hold the message in sequence order
        if self.insert_buffered(seq, msg).is_err() {
            return GapOutcome::Stale;
        }

        if self.buffer.len() > self.window {
            self.buffer.clear();
            self.resync_pending = true;
            return GapOutcome::Resync;
        }

        GapOutcome::Buffered
    }

    fn drain_contiguous(&mut self, ready: &mut Vec<UpdateMsg>) {
        while let Some((seq, _)) = self.buffer.first() {
            let expected = seq_next(self.last.expect("drain without baseline"));
            if *seq != expected {
                break;
            }
            let (seq, msg) = self.buffer.remove(0);
            self.last = Some(seq);
            ready.push(msg);
        }
    }

    /// Inserts scanning from the back, since near-in-order arrival is the
    /// common case. Errs on duplicates.
    fn insert_buffered(&mut self, seq: SequenceNumber, msg: UpdateMsg) -> Result<(), ()> {
        let mut index = self.buffer.len();

        loop {
            if index == 0 {
                self.buffer.insert(0, (seq, msg));
                return Ok(());
            }

            index -= 1;

            let (held, _) = &self.buffer[index];
            if *held == seq {
                return Err(());
            }
            if seq_less_than(*held, seq) {
                self.buffer.insert(index + 1, (seq, msg));
                return Ok(());
            }
        }
    }
}
