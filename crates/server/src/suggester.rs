//! AI suggestion capability
//!
//! A `Suggester` proposes ticket merges or follow-up actions from a
//! snapshot of root tickets. The production implementation talks to an
//! OpenAI-style chat completion endpoint; anything satisfying the trait
//! shape is acceptable.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use huddle_core::Ticket;

/// Ceiling on one upstream call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SuggestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unusable response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no completion choices returned")]
    Empty,
}

/// A group of tickets that should be merged under one parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeGroup {
    pub parent_ticket_id: Uuid,
    pub child_ticket_ids: Vec<Uuid>,
    #[serde(default)]
    pub reason: String,
}

/// A follow-up task proposed for a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub content: String,
    pub ticket_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

/// Capability that proposes merges or actions from a set of tickets.
#[async_trait]
pub trait Suggester: Send + Sync {
    async fn suggest_merges(&self, tickets: &[Ticket]) -> Result<Vec<MergeGroup>, SuggestError>;

    async fn propose_actions(
        &self,
        tickets: &[Ticket],
        context: &str,
    ) -> Result<Vec<ProposedAction>, SuggestError>;
}

const MERGE_SYSTEM_PROMPT: &str = "You are an assistant grouping similar retrospective tickets. \
Analyze the tickets and suggest which ones should be merged based on content similarity. \
Respond with a JSON object holding a 'merge_groups' array whose entries have \
'parent_ticket_id', 'child_ticket_ids' and 'reason' fields.";

const ACTIONS_SYSTEM_PROMPT: &str = "You are an assistant proposing concrete follow-up actions \
for retrospective tickets. Respond with a JSON object holding an 'actions' array whose entries \
have 'content', 'ticket_id' and 'reason' fields.";

/// OpenAI-style chat completion backend.
pub struct ChatCompletion {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct MergeGroups {
    #[serde(default)]
    merge_groups: Vec<MergeGroup>,
}

#[derive(Deserialize)]
struct Actions {
    #[serde(default)]
    actions: Vec<ProposedAction>,
}

impl ChatCompletion {
    pub fn new(endpoint: String, api_key: String, model: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint,
            api_key,
            model,
            client,
        })
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, SuggestError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_owned(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: ChatResponse = response.json().await?;
        let choice = body.choices.into_iter().next().ok_or(SuggestError::Empty)?;
        Ok(choice.message.content)
    }

    fn merge_prompt(tickets: &[Ticket]) -> String {
        let mut prompt =
            String::from("These retrospective tickets should be analyzed for potential merging:\n\n");
        for ticket in tickets {
            let _ = writeln!(prompt, "Ticket ID: {}\nContent: {}\n", ticket.id, ticket.content);
        }
        prompt.push_str(
            "Group tickets that discuss the same topic. For each group pick the most \
representative ticket as parent_ticket_id and list the others as child_ticket_ids, with a \
brief reason. Only suggest merges where tickets are clearly related; if nothing should be \
merged, return an empty merge_groups array.",
        );
        prompt
    }

    fn actions_prompt(tickets: &[Ticket], context: &str) -> String {
        let mut prompt =
            String::from("These retrospective tickets were discussed by the team:\n\n");
        for ticket in tickets {
            let _ = writeln!(
                prompt,
                "Ticket ID: {}\nContent: {}\nVotes: {}\n",
                ticket.id, ticket.content, ticket.votes
            );
        }
        if !context.trim().is_empty() {
            let _ = writeln!(prompt, "Team context: {}\n", context.trim());
        }
        prompt.push_str(
            "Propose concrete, actionable follow-ups for the most important tickets. Each \
action must reference the ticket it addresses via ticket_id. If no sensible action exists, \
return an empty actions array.",
        );
        prompt
    }
}

#[async_trait]
impl Suggester for ChatCompletion {
    async fn suggest_merges(&self, tickets: &[Ticket]) -> Result<Vec<MergeGroup>, SuggestError> {
        let content = self
            .complete(MERGE_SYSTEM_PROMPT, Self::merge_prompt(tickets))
            .await?;
        let parsed: MergeGroups = serde_json::from_str(&content)?;
        Ok(parsed.merge_groups)
    }

    async fn propose_actions(
        &self,
        tickets: &[Ticket],
        context: &str,
    ) -> Result<Vec<ProposedAction>, SuggestError> {
        let content = self
            .complete(ACTIONS_SYSTEM_PROMPT, Self::actions_prompt(tickets, context))
            .await?;
        let parsed: Actions = serde_json::from_str(&content)?;
        Ok(parsed.actions)
    }
}
