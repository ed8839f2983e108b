use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use briefwire_common::config::EmailConfig;
use briefwire_common::InformationUnit;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

use crate::digest::Digest;

const SMTP_ATTEMPTS: u32 = 3;
const MAX_BACKOFF_SECS: u64 = 30;
const SMTP_TIMEOUT_SECS: u64 = 30;

/// Delivery seam: one message out. Lets tests script per-recipient
/// failures without a mail server.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<()>;
}

/// lettre SMTP transport: implicit TLS when the config says SSL, STARTTLS
/// otherwise.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let builder = if config.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .context("SMTP relay setup failed")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .context("SMTP STARTTLS setup failed")?
        };

        let transport = builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(SMTP_TIMEOUT_SECS)))
            .build();

        Ok(Self { transport })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn deliver(&self, message: Message) -> Result<()> {
        self.transport
            .send(message)
            .await
            .context("SMTP send failed")?;
        Ok(())
    }
}

/// Renders the digest once and delivers it per recipient in isolation.
pub struct Notifier {
    transport: Box<dyn MailTransport>,
    config: EmailConfig,
    /// Optional external HTML template with `{{var}}` slots.
    template_path: Option<PathBuf>,
}

impl Notifier {
    pub fn new(transport: Box<dyn MailTransport>, config: EmailConfig) -> Self {
        Self {
            transport,
            config,
            template_path: None,
        }
    }

    pub fn with_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    /// Send the digest to every configured recipient. Each recipient gets
    /// its own message (no BCC, nobody sees the others); a per-recipient
    /// failure is logged and does not stop the rest. Returns `Ok(true)`
    /// iff at least one recipient succeeded.
    pub async fn send_digest(&self, digest: &Digest, chart_png: Option<Vec<u8>>) -> Result<bool> {
        if self.config.to_addrs.is_empty() {
            warn!("No digest recipients configured");
            return Ok(false);
        }

        let html = self.render(digest);
        let subject = format!("AI Digest - {}", digest.date.format("%Y-%m-%d"));
        let from = format!("{} <{}>", self.config.from_name, self.config.from_addr);

        let mut delivered = 0usize;
        for recipient in &self.config.to_addrs {
            match self
                .send_to_recipient(recipient, &from, &subject, &html, chart_png.as_deref())
                .await
            {
                Ok(()) => {
                    info!(recipient, "Digest delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(recipient, error = %e, "Digest delivery failed after retries");
                }
            }
        }

        info!(
            delivered,
            recipients = self.config.to_addrs.len(),
            "Digest send complete"
        );
        Ok(delivered > 0)
    }

    /// Fresh MIME structure per recipient, with up to three attempts and
    /// capped exponential backoff.
    async fn send_to_recipient(
        &self,
        recipient: &str,
        from: &str,
        subject: &str,
        html: &str,
        chart_png: Option<&[u8]>,
    ) -> Result<()> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..SMTP_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_secs(2u64.pow(attempt).min(MAX_BACKOFF_SECS));
                tokio::time::sleep(backoff).await;
            }

            let message = build_message(recipient, from, subject, html, chart_png)?;
            match self.transport.deliver(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(recipient, attempt = attempt + 1, error = %e, "SMTP attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("SMTP send failed")))
    }

    fn render(&self, digest: &Digest) -> String {
        if let Some(path) = &self.template_path {
            if let Ok(template) = std::fs::read_to_string(path) {
                return render_template(&template, digest);
            }
        }
        render_builtin(digest)
    }
}

/// `multipart/related( multipart/alternative(html), inline png )`.
fn build_message(
    recipient: &str,
    from: &str,
    subject: &str,
    html: &str,
    chart_png: Option<&[u8]>,
) -> Result<Message> {
    let alternative = MultiPart::alternative().singlepart(SinglePart::html(html.to_string()));

    let body = match chart_png {
        Some(bytes) => MultiPart::related().multipart(alternative).singlepart(
            Attachment::new_inline("trend_chart".to_string()).body(
                bytes.to_vec(),
                ContentType::parse("image/png").expect("static content type"),
            ),
        ),
        None => MultiPart::related().multipart(alternative),
    };

    Message::builder()
        .from(from.parse().context("invalid From address")?)
        .to(recipient.parse().context("invalid recipient address")?)
        .subject(subject)
        .multipart(body)
        .context("failed to assemble message")
}

/// Escape text for HTML interpolation. Everything dynamic goes through
/// here before it reaches the template.
pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Substitute `{{var}}` slots in an external template. Pick fragments are
/// pre-rendered (and pre-escaped) HTML.
fn render_template(template: &str, digest: &Digest) -> String {
    template
        .replace("{{date}}", &digest.date.format("%Y-%m-%d").to_string())
        .replace("{{daily_summary}}", &html_escape(&digest.daily_summary))
        .replace("{{top_picks}}", &render_units(&digest.top_picks, true))
        .replace("{{quick_reads}}", &render_units(&digest.quick_reads, false))
        .replace("{{totals}}", &render_totals(digest))
}

fn render_builtin(digest: &Digest) -> String {
    format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, Helvetica, Arial, sans-serif; max-width: 680px; margin: 0 auto; color: #222;">
<h1 style="border-bottom: 2px solid #222; padding-bottom: 8px;">AI Digest &middot; {date}</h1>
<p style="font-size: 15px; line-height: 1.5;">{summary}</p>
<img src="cid:trend_chart" alt="" style="max-width: 100%;">
<h2>Top Picks</h2>
{top_picks}
<h2>Quick Reads</h2>
{quick_reads}
<hr>
<p style="color: #888; font-size: 12px;">{totals}</p>
</body></html>"#,
        date = digest.date.format("%Y-%m-%d"),
        summary = html_escape(&digest.daily_summary),
        top_picks = render_units(&digest.top_picks, true),
        quick_reads = render_units(&digest.quick_reads, false),
        totals = render_totals(digest),
    )
}

fn render_units(units: &[InformationUnit], detailed: bool) -> String {
    if units.is_empty() {
        return "<p style=\"color: #888;\">Nothing in this section today.</p>".to_string();
    }
    units
        .iter()
        .map(|unit| {
            let sources: String = unit
                .sources
                .iter()
                .take(3)
                .map(|s| {
                    format!(
                        "<a href=\"{}\">{}</a>",
                        html_escape(&s.url),
                        html_escape(&s.source_name)
                    )
                })
                .collect::<Vec<_>>()
                .join(" &middot; ");

            if detailed {
                let insights: String = unit
                    .key_insights
                    .iter()
                    .take(3)
                    .map(|i| format!("<li>{}</li>", html_escape(i)))
                    .collect();
                format!(
                    "<div style=\"margin-bottom: 18px;\">\
                     <h3 style=\"margin-bottom: 4px;\">{title} <span style=\"color: #888; font-weight: normal;\">({score:.1})</span></h3>\
                     <p style=\"margin: 4px 0;\">{summary}</p>\
                     <ul style=\"margin: 4px 0;\">{insights}</ul>\
                     <p style=\"font-size: 12px;\">{sources}</p>\
                     </div>",
                    title = html_escape(&unit.title),
                    score = unit.value_score(),
                    summary = html_escape(&unit.summary),
                )
            } else {
                format!(
                    "<p style=\"margin: 6px 0;\"><b>{title}</b> &mdash; {summary} <span style=\"font-size: 12px;\">{sources}</span></p>",
                    title = html_escape(&unit.title),
                    summary = html_escape(&unit.summary),
                )
            }
        })
        .collect()
}

fn render_totals(digest: &Digest) -> String {
    format!(
        "Fetched {} articles, analyzed {}, filtered {}.",
        digest.totals.fetched, digest.totals.analyzed, digest.totals.filtered
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestTotals;
    use briefwire_common::{
        unit_fingerprint, unit_id, FiveW1H, SourceReference, TimeSensitivity, UnitType,
        ValueScores,
    };
    use chrono::Utc;
    use std::sync::Mutex;

    struct ScriptedMailer {
        /// Recipients that fail on every attempt.
        failing: Vec<String>,
        delivered: Mutex<Vec<String>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedMailer {
        fn new(failing: Vec<String>) -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                failing,
                delivered: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for std::sync::Arc<ScriptedMailer> {
        async fn deliver(&self, message: Message) -> Result<()> {
            let to = message
                .headers()
                .get_raw("To")
                .unwrap_or_default()
                .to_string();
            self.attempts.lock().unwrap().push(to.clone());
            if self.failing.iter().any(|f| to.contains(f)) {
                anyhow::bail!("scripted timeout");
            }
            self.delivered.lock().unwrap().push(to);
            Ok(())
        }
    }

    fn unit(title: &str) -> InformationUnit {
        let fingerprint = unit_fingerprint(title, title);
        InformationUnit {
            id: unit_id(&fingerprint),
            fingerprint,
            unit_type: UnitType::Fact,
            title: title.to_string(),
            content: title.to_string(),
            summary: format!("<b>Summary</b> of {title} & more"),
            event_time: None,
            report_time: Utc::now(),
            time_sensitivity: TimeSensitivity::Normal,
            five_w1h: FiveW1H::default(),
            key_insights: vec!["Insight with <script>alert(1)</script>".to_string()],
            scores: ValueScores {
                information_gain: 9.0,
                actionability: 9.0,
                scarcity: 9.0,
                impact_magnitude: 9.0,
            },
            state_change_type: None,
            state_change_subtypes: Vec::new(),
            entity_anchors: Vec::new(),
            sources: vec![SourceReference {
                url: "https://example.com/a?x=1&y=2".to_string(),
                title: title.to_string(),
                source_name: "Wire & Co".to_string(),
                published_at: None,
                excerpt: String::new(),
                credibility_tier: 1,
            }],
            primary_source: String::new(),
            merged_count: 1,
            is_sent: false,
            entity_processed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn digest() -> Digest {
        Digest {
            date: Utc::now().date_naive(),
            daily_summary: "Summary with <tags> & ampersands".to_string(),
            top_picks: vec![unit("Top pick one")],
            quick_reads: vec![unit("Quick read one")],
            totals: DigestTotals {
                fetched: 10,
                analyzed: 8,
                filtered: 2,
            },
        }
    }

    fn email_config(recipients: &[&str]) -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            use_ssl: true,
            username: "user".to_string(),
            password: "pass".to_string(),
            from_addr: "digest@example.com".to_string(),
            from_name: "Briefwire".to_string(),
            to_addrs: recipients.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_recipient_isolation_and_retries() {
        let mailer = ScriptedMailer::new(vec!["b@x.example".to_string()]);
        let notifier = Notifier::new(
            Box::new(mailer.clone()),
            email_config(&["a@x.example", "b@x.example", "c@x.example"]),
        );

        let ok = notifier.send_digest(&digest(), None).await.unwrap();
        assert!(ok);

        let delivered = mailer.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().any(|d| d.contains("a@x.example")));
        assert!(delivered.iter().any(|d| d.contains("c@x.example")));

        // The failing recipient burned all three attempts.
        let b_attempts = mailer
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.contains("b@x.example"))
            .count();
        assert_eq!(b_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn all_recipients_failing_returns_false() {
        let mailer = ScriptedMailer::new(vec!["x.example".to_string()]);
        let notifier = Notifier::new(Box::new(mailer), email_config(&["a@x.example", "b@x.example"]));

        let ok = notifier.send_digest(&digest(), None).await.unwrap();
        assert!(!ok);
    }

    #[test]
    fn builtin_rendering_escapes_dynamic_text() {
        let html = render_builtin(&digest());
        assert!(html.contains("Summary with &lt;tags&gt; &amp; ampersands"));
        assert!(html.contains("&lt;b&gt;Summary&lt;/b&gt;"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("https://example.com/a?x=1&amp;y=2"));
        assert!(html.contains("Wire &amp; Co"));
        assert!(html.contains("Fetched 10 articles, analyzed 8, filtered 2."));
    }

    #[test]
    fn external_template_substitution() {
        let template = "<html>{{date}}|{{daily_summary}}|{{top_picks}}|{{totals}}</html>";
        let rendered = render_template(template, &digest());
        assert!(rendered.contains(&Utc::now().date_naive().format("%Y-%m-%d").to_string()));
        assert!(rendered.contains("Summary with &lt;tags&gt;"));
        assert!(rendered.contains("Top pick one"));
    }

    #[test]
    fn message_structure_is_related_with_inline_chart() {
        let message = build_message(
            "a@x.example",
            "Briefwire <digest@example.com>",
            "AI Digest - 2030-01-01",
            "<html></html>",
            Some(&[0x89, 0x50, 0x4e, 0x47]),
        )
        .unwrap();

        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("multipart/related"));
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("text/html"));
        assert!(formatted.contains("image/png"));
        assert!(formatted.contains("trend_chart"));
        assert!(formatted.contains("Subject: AI Digest - 2030-01-01"));
    }

    #[test]
    fn escape_covers_the_special_five() {
        assert_eq!(html_escape(r#"<a href="x">&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;");
    }
}
