use crossbeam_channel::{unbounded, Receiver, Sender};

/// Opaque handle identifying one suspended frontend request.
pub type Cookie = u64;

/// Status delivered when a suspended cookie is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    /// The blocking condition cleared; re-drive the operation.
    Success,
    KeyNotFound,
    NotMyVbucket,
    TempFail,
}

/// Continuation sink for the cookie / would-block protocol. A frontend
/// call that cannot complete returns `WouldBlock` and parks its cookie;
/// the engine resumes it through this callback exactly once per parking.
pub trait EngineNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie, status: NotifyStatus);
}

/// Channel-backed notifier; the receiving side drains `(cookie, status)`
/// pairs. The default wiring for embedders and tests.
pub struct ChannelNotifier {
    tx: Sender<(Cookie, NotifyStatus)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, Receiver<(Cookie, NotifyStatus)>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl EngineNotifier for ChannelNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: NotifyStatus) {
        let _ = self.tx.send((cookie, status));
    }
}

/// Notifier that drops notifications; for embedders that poll instead.
pub struct NullNotifier;

impl EngineNotifier for NullNotifier {
    fn notify_io_complete(&self, _cookie: Cookie, _status: NotifyStatus) {}
}
