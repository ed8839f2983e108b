//! End-to-end digest flow: seed unsent units, curate, deliver through a
//! scripted mailer, and verify sent-state bookkeeping.

use std::sync::{Arc, Mutex};

use ai_client::{ChatRequest, ChatTransport, Completion, Gateway};
use anyhow::Result;
use async_trait::async_trait;
use briefwire_agents::{Curator, CuratorSettings};
use briefwire_archive::InformationStore;
use briefwire_common::config::EmailConfig;
use briefwire_common::{
    unit_fingerprint, unit_id, EntityAnchor, FiveW1H, InformationUnit, SourceReference,
    TimeSensitivity, TokenUsage, UnitType, ValueScores,
};
use briefwire_engine::{DigestBuilder, DigestTotals, MailTransport, Notifier};
use briefwire_index::HashedIndex;
use chrono::Utc;
use lettre::Message;

struct CannedTransport;

#[async_trait]
impl ChatTransport for CannedTransport {
    async fn send(&self, request: &ChatRequest) -> Result<Completion> {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        // History filter asks for JSON; the summary prompt wants prose.
        let text = if system.contains("near-duplicates") {
            r#"{"exclude_indices": []}"#.to_string()
        } else {
            "The day's signal, in one paragraph.".to_string()
        };
        Ok(Completion {
            text,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
            },
        })
    }
}

#[derive(Clone, Default)]
struct RecordingMailer {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn deliver(&self, message: Message) -> Result<()> {
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        self.sent.lock().unwrap().push(formatted);
        Ok(())
    }
}

fn unit(title: &str, score: f64, root: &str) -> InformationUnit {
    let fingerprint = unit_fingerprint(title, title);
    InformationUnit {
        id: unit_id(&fingerprint),
        fingerprint,
        unit_type: UnitType::Fact,
        title: title.to_string(),
        content: format!("{title} content."),
        summary: format!("{title} summary."),
        event_time: None,
        report_time: Utc::now(),
        time_sensitivity: TimeSensitivity::Normal,
        five_w1h: FiveW1H::default(),
        key_insights: vec![format!("{title} insight")],
        scores: ValueScores {
            information_gain: score,
            actionability: score,
            scarcity: score,
            impact_magnitude: score,
        },
        state_change_type: None,
        state_change_subtypes: Vec::new(),
        entity_anchors: vec![EntityAnchor {
            l1_name: "Acme".to_string(),
            l3_root: root.to_string(),
            ..Default::default()
        }],
        sources: vec![SourceReference {
            url: format!("https://example.com/{}", title.replace(' ', "-")),
            title: title.to_string(),
            source_name: "Wire".to_string(),
            published_at: None,
            excerpt: String::new(),
            credibility_tier: 2,
        }],
        primary_source: String::new(),
        merged_count: 1,
        is_sent: false,
        entity_processed: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn digest_flow_marks_only_delivered_units_sent() {
    let pool = briefwire_archive::connect_memory().await.unwrap();
    let units = InformationStore::new(pool, Arc::new(HashedIndex::new()));

    for unit in [
        unit("Chip export rules tighten", 9.2, "Semiconductors"),
        unit("Foundation model ships", 8.7, "AI"),
        unit("Grid storage auction clears", 8.4, "Energy"),
        unit("Mid-tier funding round", 6.0, "Finance"),
        unit("Minor product refresh", 2.5, "Consumer Tech"),
    ] {
        units.save(&unit).await.unwrap();
    }

    let gateway = Arc::new(Gateway::new(Arc::new(CannedTransport), "test-model"));
    let curator = Curator::new(gateway, CuratorSettings::default());
    let builder = DigestBuilder::new(units.clone());

    let digest = builder
        .build(
            &curator,
            DigestTotals {
                fetched: 12,
                analyzed: 5,
                filtered: 7,
            },
        )
        .await
        .unwrap();

    assert_eq!(digest.top_picks.len(), 3);
    assert_eq!(digest.quick_reads.len(), 1);
    assert_eq!(digest.daily_summary, "The day's signal, in one paragraph.");

    let mailer = RecordingMailer::default();
    let notifier = Notifier::new(
        Box::new(mailer.clone()),
        EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            use_ssl: true,
            username: "u".to_string(),
            password: "p".to_string(),
            from_addr: "digest@example.com".to_string(),
            from_name: "Briefwire".to_string(),
            to_addrs: vec!["one@example.com".to_string(), "two@example.com".to_string()],
        },
    );

    let sent = notifier.send_digest(&digest, None).await.unwrap();
    assert!(sent);

    // One isolated message per recipient; nobody sees the other.
    let messages = mailer.sent.lock().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].contains("To: one@example.com"));
    assert!(!messages[0].contains("two@example.com"));
    assert!(messages[1].contains("To: two@example.com"));
    let subject = format!("AI Digest - {}", digest.date.format("%Y-%m-%d"));
    assert!(messages.iter().all(|m| m.contains(&subject)));

    // Delivered units leave the unsent pool; the excluded one stays.
    builder.mark_delivered(&digest).await.unwrap();
    let remaining = units.get_unsent(10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].title, "Minor product refresh");
}
