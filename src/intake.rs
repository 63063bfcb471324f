/// Request intake module
///
/// Collects consultation and order requests step by step (name, phone, and
/// order details for orders). Sessions live in memory per user, the same way
/// conversation history does; completing or cancelling a session removes it.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// What a user asked for via the keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Consultation,
    Order,
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Consultation => "consultation",
            RequestKind::Order => "order",
        }
    }
}

/// Telegram identity captured when the intake starts
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub user_id: u64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone)]
struct IntakeSession {
    kind: RequestKind,
    profile: UserProfile,
    name: Option<String>,
    phone: Option<String>,
}

/// A fully collected request, ready to notify managers and log
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub kind: RequestKind,
    pub profile: UserProfile,
    pub name: String,
    pub phone: String,
    pub order_details: Option<String>,
}

impl CompletedRequest {
    /// Markdown notification for the managers' group
    pub fn group_message(&self, timestamp: &str) -> String {
        let username = self
            .profile
            .username
            .as_deref()
            .unwrap_or("not set");

        let mut message = match self.kind {
            RequestKind::Consultation => String::from("📞 *New consultation request*\n\n"),
            RequestKind::Order => String::from("🛒 *New order request*\n\n"),
        };

        message.push_str(&format!("👤 *Name:* {}\n", self.name));
        message.push_str(&format!("📱 *Phone:* {}\n", self.phone));
        if let Some(details) = &self.order_details {
            message.push_str(&format!("📦 *Order details:* {}\n", details));
        }
        message.push_str(&format!("🆔 *User id:* {}\n", self.profile.user_id));
        message.push_str(&format!("👤 *Username:* @{}\n", username));
        message.push_str(&format!("📅 *Time:* {}", timestamp));

        message
    }

    /// One-line summary for the Orders worksheet
    pub fn order_info(&self) -> String {
        format!(
            "Name: {}, Phone: {}, Order: {}",
            self.name,
            self.phone,
            self.order_details.as_deref().unwrap_or("not specified")
        )
    }
}

/// The next thing the bot should do with an active session
#[derive(Debug, Clone)]
pub enum IntakeStep {
    AskPhone,
    AskOrderDetails,
    Completed(CompletedRequest),
}

/// Per-user intake sessions
pub struct IntakeManager {
    sessions: RwLock<HashMap<u64, IntakeSession>>,
}

impl IntakeManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a session; any in-flight session for this user is replaced
    pub async fn begin(&self, profile: UserProfile, kind: RequestKind) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            profile.user_id,
            IntakeSession {
                kind,
                profile,
                name: None,
                phone: None,
            },
        );
    }

    pub async fn is_active(&self, user_id: u64) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }

    /// Feed the next user message into the session
    ///
    /// Returns None when the user has no active session (the caller asks them
    /// to start over from the keyboard). Completion removes the session.
    pub async fn advance(&self, user_id: u64, text: &str) -> Option<IntakeStep> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&user_id)?;
        let text = text.trim().to_string();

        if session.name.is_none() {
            session.name = Some(text);
            return Some(IntakeStep::AskPhone);
        }

        if session.phone.is_none() {
            session.phone = Some(text);
            match session.kind {
                RequestKind::Order => return Some(IntakeStep::AskOrderDetails),
                RequestKind::Consultation => {
                    let session = sessions.remove(&user_id)?;
                    return Some(IntakeStep::Completed(complete(session, None)));
                }
            }
        }

        // Order sessions with name and phone are waiting for the details
        let session = sessions.remove(&user_id)?;
        Some(IntakeStep::Completed(complete(session, Some(text))))
    }

    /// Drop the session, returning whether one existed
    pub async fn cancel(&self, user_id: u64) -> bool {
        self.sessions.write().await.remove(&user_id).is_some()
    }
}

fn complete(session: IntakeSession, order_details: Option<String>) -> CompletedRequest {
    CompletedRequest {
        kind: session.kind,
        profile: session.profile,
        name: session.name.unwrap_or_else(|| "not specified".to_string()),
        phone: session.phone.unwrap_or_else(|| "not specified".to_string()),
        order_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(user_id: u64) -> UserProfile {
        UserProfile {
            user_id,
            username: Some("alice".to_string()),
            first_name: Some("Alice".to_string()),
            last_name: None,
        }
    }

    #[tokio::test]
    async fn consultation_completes_after_name_and_phone() {
        let manager = IntakeManager::new();
        manager.begin(profile(1), RequestKind::Consultation).await;

        assert!(matches!(
            manager.advance(1, "Alice").await,
            Some(IntakeStep::AskPhone)
        ));

        match manager.advance(1, "+4912345").await {
            Some(IntakeStep::Completed(request)) => {
                assert_eq!(request.kind, RequestKind::Consultation);
                assert_eq!(request.name, "Alice");
                assert_eq!(request.phone, "+4912345");
                assert!(request.order_details.is_none());
            }
            other => panic!("unexpected step: {:?}", other),
        }

        // Session is gone after completion
        assert!(!manager.is_active(1).await);
        assert!(manager.advance(1, "anything").await.is_none());
    }

    #[tokio::test]
    async fn order_asks_for_details_before_completing() {
        let manager = IntakeManager::new();
        manager.begin(profile(2), RequestKind::Order).await;

        assert!(matches!(
            manager.advance(2, "Bob").await,
            Some(IntakeStep::AskPhone)
        ));
        assert!(matches!(
            manager.advance(2, "+7999").await,
            Some(IntakeStep::AskOrderDetails)
        ));

        match manager.advance(2, "Two cleansing milks").await {
            Some(IntakeStep::Completed(request)) => {
                assert_eq!(request.order_details.as_deref(), Some("Two cleansing milks"));
                assert_eq!(
                    request.order_info(),
                    "Name: Bob, Phone: +7999, Order: Two cleansing milks"
                );
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[tokio::test]
    async fn beginning_again_restarts_the_session() {
        let manager = IntakeManager::new();
        manager.begin(profile(3), RequestKind::Order).await;
        manager.advance(3, "Bob").await;

        // Pressing the other button starts over
        manager.begin(profile(3), RequestKind::Consultation).await;
        assert!(matches!(
            manager.advance(3, "Robert").await,
            Some(IntakeStep::AskPhone)
        ));
    }

    #[tokio::test]
    async fn cancel_drops_the_session() {
        let manager = IntakeManager::new();
        manager.begin(profile(4), RequestKind::Consultation).await;

        assert!(manager.cancel(4).await);
        assert!(!manager.cancel(4).await);
        assert!(manager.advance(4, "Alice").await.is_none());
    }

    #[test]
    fn group_message_includes_order_details() {
        let request = CompletedRequest {
            kind: RequestKind::Order,
            profile: profile(5),
            name: "Bob".to_string(),
            phone: "+7999".to_string(),
            order_details: Some("Thermal tonic".to_string()),
        };

        let message = request.group_message("2026-08-07 12:00:00");
        assert!(message.starts_with("🛒 *New order request*"));
        assert!(message.contains("*Phone:* +7999"));
        assert!(message.contains("*Order details:* Thermal tonic"));
        assert!(message.contains("@alice"));
        assert!(message.contains("2026-08-07 12:00:00"));
    }

    #[test]
    fn group_message_handles_missing_username() {
        let request = CompletedRequest {
            kind: RequestKind::Consultation,
            profile: UserProfile {
                user_id: 6,
                ..Default::default()
            },
            name: "Eve".to_string(),
            phone: "+1".to_string(),
            order_details: None,
        };

        let message = request.group_message("2026-08-07 12:00:00");
        assert!(message.contains("@not set"));
        assert!(!message.contains("Order details"));
    }
}
