//! The pipeline engine: scheduling, orchestration, digest assembly, and
//! SMTP delivery.

pub mod digest;
pub mod notifier;
pub mod orchestrator;
pub mod runner;
pub mod scheduler;

pub use digest::{Digest, DigestBuilder, DigestTotals};
pub use notifier::{html_escape, MailTransport, Notifier, SmtpMailer};
pub use orchestrator::Orchestrator;
pub use runner::{CycleStats, Runner, RunnerSettings};
pub use scheduler::Scheduler;
