use crate::conversation::{Conversation, Outcome};

/// Exchanges from the conversation included as context.
pub const CONTEXT_EXCHANGES: usize = 3;

pub fn system_prompt(schema: &str) -> String {
    format!(
        "You are an expert data analyst. Reply with a single SQLite SELECT statement and nothing else.

Dates:
- The dataset only covers a fixed historical period. Never use DATE('now'), CURRENT_DATE or CURRENT_TIMESTAMP.
- For relative periods (\"last 6 months\", \"last 2 quarters\") compute the boundary from the data itself, e.g.
  WHERE order_purchase_timestamp >= (
      SELECT DATE(MAX(order_purchase_timestamp), '-6 months')
      FROM olist_orders_dataset
  )

Rules:
- Use only SELECT, FROM, JOIN, WHERE, GROUP BY, ORDER BY and LIMIT.
- Write LIMIT at most once, and only as the last clause. Never put LIMIT inside a subquery.
- Every aggregation needs a GROUP BY.
- Do not use QUALIFY, window functions, USING(...) or ILIKE.
- Join with explicit JOIN ... ON conditions.

Return only the SQL, without explanations.

Schema:
{}",
        schema
    )
}

pub fn user_prompt(question: &str, conversation: &Conversation) -> String {
    let mut prompt = String::new();
    let recent = conversation.recent(CONTEXT_EXCHANGES);
    if !recent.is_empty() {
        prompt.push_str("Earlier in this conversation:\n");
        for exchange in recent {
            prompt.push_str(&format!("Q: {}\n", exchange.question));
            if let Some(sql) = &exchange.sql {
                prompt.push_str(&format!("SQL: {}\n", sql));
            }
            if let Outcome::Failed(message) = &exchange.outcome {
                prompt.push_str(&format!("Failed: {}\n", message));
            }
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "Question: {}\nReturn only SQL for SQLite.",
        question.trim()
    ));
    prompt
}
