//! Keyword fallback replies.
//!
//! A pure function of the latest user message: the first topic (in table
//! order) with a keyword matching the start of any word wins, otherwise the
//! generic reply is used. Every reply is non-empty.

use serde::Serialize;

/// Topics recognised by the fallback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackTopic {
    Cost,
    Security,
    Migration,
    Timeline,
    Integration,
    Compliance,
    Performance,
    Support,
}

struct TopicRule {
    topic: FallbackTopic,
    keywords: &'static [&'static str],
    reply: &'static str,
}

const TOPIC_TABLE: &[TopicRule] = &[
    TopicRule {
        topic: FallbackTopic::Cost,
        keywords: &["cost", "price", "pricing", "budget", "expens", "afford", "fee", "roi"],
        reply: "Cost usually comes down to three things: the scope of the work, the \
                licensing or infrastructure involved, and the ongoing operating effort. \
                If you can share the rough size of the team and systems in scope, I can \
                outline a realistic budget range and where the biggest savings tend to be.",
    },
    TopicRule {
        topic: FallbackTopic::Security,
        keywords: &["secur", "vulnerab", "breach", "encrypt", "threat", "attack", "password"],
        reply: "For security questions I usually start by mapping what data you hold and \
                who can reach it. From there we can look at access controls, encryption in \
                transit and at rest, and monitoring. Which systems or data are you most \
                concerned about?",
    },
    TopicRule {
        topic: FallbackTopic::Migration,
        keywords: &["migrat", "move", "moving", "upgrade", "legacy", "cloud", "transition"],
        reply: "A migration goes best when it is staged: inventory what you run today, \
                pick a low-risk pilot, then move the rest in waves with a rollback plan for \
                each. Tell me what you are migrating from and to, and I can sketch the \
                phases.",
    },
    TopicRule {
        topic: FallbackTopic::Timeline,
        keywords: &["timeline", "deadline", "schedule", "how long", "when", "duration", "eta"],
        reply: "Timelines depend mostly on scope and on how quickly decisions can be made \
                on your side. A typical engagement runs through discovery, delivery and \
                handover. If you have a target date in mind, I can work backwards from it \
                to see what is realistic.",
    },
    TopicRule {
        topic: FallbackTopic::Integration,
        keywords: &["integrat", "api", "connect", "sync", "interface", "webhook"],
        reply: "Integrations are easiest to plan once we know which systems own which \
                data and how fresh it needs to be. Could you list the systems that need to \
                talk to each other and whether they expose APIs today?",
    },
    TopicRule {
        topic: FallbackTopic::Compliance,
        keywords: &["complian", "gdpr", "hipaa", "soc", "iso", "regulat", "audit", "privacy"],
        reply: "Compliance work starts with knowing which regulations apply to you and \
                where regulated data lives. From there we can map existing controls against \
                the requirements and close the gaps. Which frameworks or regulators are you \
                working with?",
    },
    TopicRule {
        topic: FallbackTopic::Performance,
        keywords: &["perform", "slow", "latency", "speed", "scal", "throughput", "load"],
        reply: "To get to the bottom of performance issues it helps to measure first: \
                where time is spent, under what load, and how that has changed over time. \
                What symptoms are you seeing, and when did they start?",
    },
    TopicRule {
        topic: FallbackTopic::Support,
        keywords: &["support", "help desk", "maintenan", "sla", "outage", "incident"],
        reply: "Ongoing support can be shaped around the response times you need and the \
                systems that matter most. Tell me about your current support setup and \
                what has been missing, and I can suggest a model that fits.",
    },
];

/// Reply used when no topic matches.
pub const GENERIC_REPLY: &str = "Thanks for the question. Let me help you explore this \
    further: could you tell me a bit more about your goals, the systems involved, and \
    any constraints you are working within?";

/// A fallback reply and the topic that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackReply {
    pub topic: Option<FallbackTopic>,
    pub content: &'static str,
}

/// Pick the fallback reply for `latest_user_message`.
pub fn fallback_reply(latest_user_message: &str) -> FallbackReply {
    let text = latest_user_message.to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for rule in TOPIC_TABLE {
        let hit = rule.keywords.iter().any(|kw| {
            if kw.contains(' ') {
                text.contains(kw)
            } else {
                words.iter().any(|w| w.starts_with(kw))
            }
        });
        if hit {
            return FallbackReply {
                topic: Some(rule.topic),
                content: rule.reply,
            };
        }
    }

    FallbackReply {
        topic: None,
        content: GENERIC_REPLY,
    }
}

/// The canned reply for `topic`.
pub fn topic_reply(topic: FallbackTopic) -> &'static str {
    TOPIC_TABLE
        .iter()
        .find(|r| r.topic == topic)
        .map(|r| r.reply)
        .unwrap_or(GENERIC_REPLY)
}
