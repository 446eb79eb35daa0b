use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::conversation::{Conversation, Exchange, Outcome};
use crate::db::DataStore;
use crate::error::GuardError;
use crate::guard::{Guard, GuardedResult};
use crate::llm::prompt::{system_prompt, user_prompt};
use crate::llm::{build_client, ModelClient};

/// The result of one question. Exactly one guard decision was made.
#[derive(Debug)]
pub struct AgentReply {
    pub question: String,
    pub outcome: Result<GuardedResult, GuardError>,
}

/// Question in, guarded result out. The schema description is fetched on
/// first use and reused for the life of the agent.
pub struct DataAgent {
    model: Box<dyn ModelClient>,
    guard: Guard,
    store: Arc<dyn DataStore>,
    query_timeout: Option<Duration>,
    schema: OnceCell<String>,
}

impl DataAgent {
    pub fn new(
        model: Box<dyn ModelClient>,
        guard: Guard,
        store: Arc<dyn DataStore>,
        query_timeout: Option<Duration>,
    ) -> Self {
        Self {
            model,
            guard,
            store,
            query_timeout,
            schema: OnceCell::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            build_client(&config.model)?,
            Guard::new(config.policy()?),
            config.data_store(),
            config.query.timeout(),
        ))
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub fn model(&self) -> &dyn ModelClient {
        self.model.as_ref()
    }

    /// Ask one question and record the exchange in `conversation`.
    pub async fn answer(&self, question: &str, conversation: &mut Conversation) -> AgentReply {
        let outcome = self.run(question, conversation).await;

        let (sql, recorded) = match &outcome {
            Ok(done) => {
                let recorded = if done.result.is_empty() {
                    Outcome::Empty
                } else {
                    Outcome::Rows(done.result.row_count)
                };
                (Some(done.statement.sql.clone()), recorded)
            }
            Err(e) => (e.offending_sql().map(str::to_string), Outcome::Failed(e.message())),
        };
        info!(question, outcome = ?recorded, "answered");
        conversation.record(Exchange {
            question: question.to_string(),
            sql,
            outcome: recorded,
            asked_at: Utc::now(),
        });

        AgentReply {
            question: question.to_string(),
            outcome,
        }
    }

    async fn run(
        &self,
        question: &str,
        conversation: &Conversation,
    ) -> Result<GuardedResult, GuardError> {
        let schema = self.schema().await?;
        let system = system_prompt(schema);
        let user = user_prompt(question, conversation);

        let raw = self.model.complete(&system, &user).await?;
        debug!(provider = %self.model.provider(), raw = %raw, "model output");

        self.guard
            .run(&raw, self.store.as_ref(), self.query_timeout)
            .await
    }

    async fn schema(&self) -> Result<&str, GuardError> {
        self.schema
            .get_or_try_init(|| async {
                self.store
                    .describe_schema()
                    .await
                    .map_err(|e| GuardError::Execution {
                        message: format!("failed to describe schema: {}", e),
                        sql: String::new(),
                    })
            })
            .await
            .map(String::as_str)
    }
}
