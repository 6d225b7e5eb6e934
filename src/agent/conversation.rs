//! Thread message retrieval
//!
//! Paging helpers over [`CompletionService::list_messages`] and extraction of
//! the assistant text a run produced.

use crate::core::{Message, MessageOrder, Result};
use crate::llm::{CompletionService, MessageQuery};

/// Id of the newest message on a thread, if it has any
pub async fn latest_message_id(
    service: &dyn CompletionService,
    thread_id: &str,
) -> Result<Option<String>> {
    let newest = service
        .list_messages(thread_id, &MessageQuery::new(MessageOrder::Desc, 1))
        .await?;
    Ok(newest.into_iter().next().map(|m| m.id))
}

/// Every message after `after` (or from the start), oldest first
pub async fn messages_after(
    service: &dyn CompletionService,
    thread_id: &str,
    after: Option<&str>,
    page_size: usize,
) -> Result<Vec<Message>> {
    let page_size = page_size.max(1);
    let mut cursor = after.map(str::to_string);
    let mut messages = Vec::new();

    loop {
        let mut query = MessageQuery::new(MessageOrder::Asc, page_size);
        if let Some(id) = &cursor {
            query = query.after(id.clone());
        }

        let page = service.list_messages(thread_id, &query).await?;
        let full_page = page.len() >= page_size;
        cursor = page.last().map(|m| m.id.clone());
        messages.extend(page);

        if !full_page || cursor.is_none() {
            return Ok(messages);
        }
    }
}

/// Assistant text of `messages`, in order, one message per line
pub fn assistant_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.is_assistant())
        .map(|m| m.content.as_str())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
