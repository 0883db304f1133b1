use deskmate_core::{IntentPayload, IntentScore};
use regex::Regex;

use crate::router::is_known_intent;

pub const GREETING_REPLY: &str = "Hello! How can I help you today?";

struct IntentRule {
    intent: &'static str,
    keywords: Vec<&'static str>,
    patterns: Vec<Regex>,
    negative: Vec<&'static str>,
    priority: u8,
}

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Keyword/regex intent classifier used when no model is available.
pub struct RuleClassifier {
    rules: Vec<IntentRule>,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleClassifier {
    pub fn new() -> Self {
        let rules = vec![
            // ── Greeting (highest priority, whole-message only) ──
            IntentRule {
                intent: "greeting",
                keywords: vec![],
                patterns: patterns(&[
                    r"(?i)^(hi|hello|hey|yo|howdy|greetings|good\s*(morning|afternoon|evening))(\s+there)?[\s!.?~]*$",
                    r"(?i)^(thanks|thank\s*you|ok|okay|got\s*it|cool)[\s!.?~]*$",
                    r"(?i)^(bye|goodbye|see\s*you)[\s!.?~]*$",
                ]),
                negative: vec![],
                priority: 10,
            },
            // ── Screen capture ──
            IntentRule {
                intent: "screen_capture",
                keywords: vec!["screenshot", "screen shot", "capture the screen", "capture my screen"],
                patterns: patterns(&[
                    r"(?i)\b(what'?s|what is|read|look at)\b.*\bon (my|the) screen\b",
                ]),
                negative: vec![],
                priority: 9,
            },
            // ── Memory retrieval ──
            IntentRule {
                intent: "memory_retrieve",
                keywords: vec!["do you remember", "did i tell you", "recall", "what did i say"],
                patterns: patterns(&[
                    r"(?i)\b(what|where|when|which)('s| is| was| are| were)? my\b",
                    r"(?i)\bwhat did i (tell|say|mention)\b",
                ]),
                negative: vec!["remind me"],
                priority: 8,
            },
            // ── Memory storage ──
            IntentRule {
                intent: "memory_store",
                keywords: vec!["remember that", "remember this", "note that", "don't forget", "save this", "keep in mind"],
                patterns: patterns(&[
                    r"(?i)^remember\b",
                    r"(?i)^my\s+[\w\s]+\s+is\s+\S+",
                ]),
                negative: vec!["remind me", "do you remember"],
                priority: 8,
            },
            // ── Reminder ──
            IntentRule {
                intent: "reminder",
                keywords: vec!["remind me", "reminder", "alert me", "ping me"],
                patterns: vec![],
                negative: vec![],
                priority: 7,
            },
            // ── Schedule ──
            IntentRule {
                intent: "schedule",
                keywords: vec!["schedule", "meeting", "appointment", "calendar", "book a", "set up a call"],
                patterns: patterns(&[
                    r"(?i)\b(tomorrow|tonight|next (week|month|monday|tuesday|wednesday|thursday|friday))\b.*\bat\b",
                    r"(?i)\bat \d{1,2}(:\d{2})?\s*(am|pm)\b",
                ]),
                negative: vec![],
                priority: 7,
            },
            // ── Window / app commands ──
            IntentRule {
                intent: "command",
                keywords: vec!["hide all windows", "show all windows", "hide windows", "show windows"],
                patterns: patterns(&[
                    r"(?i)^(please\s+)?(open|close|hide|show|minimize|maximize|launch|start|stop|run|quit|restore)\b",
                ]),
                negative: vec![],
                priority: 6,
            },
        ];

        Self { rules }
    }

    /// Matching intents, highest priority first, at most two.
    /// An empty result means nothing matched.
    pub fn matches(&self, input: &str) -> Vec<&'static str> {
        let input_lower = input.to_lowercase();
        let mut matches: Vec<(&'static str, u8)> = self
            .rules
            .iter()
            .filter(|rule| self.rule_matches(rule, input.trim(), &input_lower))
            .map(|rule| (rule.intent, rule.priority))
            .collect();

        // Stable sort keeps declaration order among equal priorities.
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        matches.dedup_by(|a, b| a.0 == b.0);

        if matches.len() > 1 {
            matches.retain(|m| m.0 != "greeting");
        }
        matches.into_iter().take(2).map(|(intent, _)| intent).collect()
    }

    pub fn classify(&self, input: &str) -> IntentPayload {
        let matched = self.matches(input);
        let Some(primary) = matched.first().copied() else {
            let mut payload = IntentPayload::fallback(input);
            payload.intents[0].confidence = 0.5;
            payload.intents[0].reasoning = Some("no rule matched".to_string());
            return payload;
        };

        let intents = matched
            .iter()
            .enumerate()
            .map(|(i, intent)| IntentScore {
                intent: intent.to_string(),
                confidence: if i == 0 { 0.7 } else { 0.5 },
                reasoning: Some("matched keyword rules".to_string()),
            })
            .collect();

        IntentPayload {
            intents,
            primary_intent: primary.to_string(),
            entities: Vec::new(),
            requires_memory_access: matched.contains(&"memory_retrieve"),
            capture_screen: None,
            source_text: input.to_string(),
            suggested_response: (primary == "greeting").then(|| GREETING_REPLY.to_string()),
        }
        .ensure_invariants()
    }

    fn rule_matches(&self, rule: &IntentRule, input: &str, input_lower: &str) -> bool {
        if rule.negative.iter().any(|neg| input_lower.contains(neg)) {
            return false;
        }
        rule.patterns.iter().any(|p| p.is_match(input))
            || rule.keywords.iter().any(|k| input_lower.contains(k))
    }
}

/// Whether a model-produced intent name is one the router understands.
pub fn is_supported_intent(intent: &str) -> bool {
    is_known_intent(intent)
}
