//! Topic constants. Topics follow `stellwerk.<role>.<event>`, named after
//! the sender's role. Replies append [`REPLY_SUFFIX`].

/// Suffix appended to a request topic for its reply.
pub const REPLY_SUFFIX: &str = ".reply";

// ── Worker → scheduler ────────────────────────────────────────────────────

pub const WORKER_REGISTER: &str = "stellwerk.worker.register";
pub const WORKER_REGISTER_REPLY: &str = "stellwerk.worker.register.reply";

pub const WORKER_HEARTBEAT: &str = "stellwerk.worker.heartbeat";

pub const WORKER_FINISHED: &str = "stellwerk.worker.finished";

pub const WORKER_FAILED: &str = "stellwerk.worker.failed";

/// Sent on orderly shutdown so the scheduler need not wait for a timeout.
pub const WORKER_GOODBYE: &str = "stellwerk.worker.goodbye";

// ── Scheduler → worker ────────────────────────────────────────────────────

pub const SCHEDULER_ASSIGN: &str = "stellwerk.scheduler.assign";

pub const SCHEDULER_RELEASE: &str = "stellwerk.scheduler.release";

/// The scheduler no longer recognises the worker.
pub const SCHEDULER_EVICT: &str = "stellwerk.scheduler.evict";

// ── Worker ↔ worker ───────────────────────────────────────────────────────

pub const PEER_FETCH: &str = "stellwerk.peer.fetch";
pub const PEER_FETCH_REPLY: &str = "stellwerk.peer.fetch.reply";

// ── Client → scheduler ────────────────────────────────────────────────────

pub const CLIENT_SUBMIT: &str = "stellwerk.client.submit";
pub const CLIENT_SUBMIT_REPLY: &str = "stellwerk.client.submit.reply";

pub const CLIENT_GATHER: &str = "stellwerk.client.gather";

pub const CLIENT_CANCEL: &str = "stellwerk.client.cancel";

pub const CLIENT_RELEASE: &str = "stellwerk.client.release";

pub const CLIENT_HEARTBEAT: &str = "stellwerk.client.heartbeat";

pub const CLIENT_GOODBYE: &str = "stellwerk.client.goodbye";

pub const CLIENT_DIAGNOSTICS: &str = "stellwerk.client.diagnostics";
pub const CLIENT_DIAGNOSTICS_REPLY: &str = "stellwerk.client.diagnostics.reply";

// ── Scheduler → client ────────────────────────────────────────────────────

pub const SCHEDULER_RESULT: &str = "stellwerk.scheduler.result";

pub const SCHEDULER_RESULT_FAILED: &str = "stellwerk.scheduler.result.failed";
