//! Prompt composer: the per-step system prompt and the knowledge-grounded
//! message chain.
//!
//! The system prompt is assembled from one `<action-*>` block per allowed
//! action, so the model only ever reads instructions for actions the gate
//! vector permits. The message chain replays the knowledge base as
//! question/answer turns before the real conversation, which is how
//! collected evidence becomes "things the model already said".

use crate::actions::{KnowledgeItem, KnowledgeKind};
use crate::agent::state::GateVector;
use crate::urls::{UrlSnippet, weighted_urls_to_string};
use crate::{MAX_URLS_IN_PROMPT, Message};
use chrono::Utc;

/// Drop blank lines and per-line indentation noise.
pub fn remove_extra_line_breaks(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Everything the system prompt depends on for one step.
pub struct PromptInputs<'a> {
    pub diary: &'a [String],
    pub all_keywords: &'a [String],
    pub weighted_urls: &'a [UrlSnippet],
    pub gates: GateVector,
    pub beast_mode: bool,
}

/// Assemble the per-step system prompt.
pub fn compose_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "Current date: {}\n\nYou are an advanced AI research agent specialized in multistep \
         reasoning. Using your best knowledge, conversation with the user and lessons learned, \
         answer the user question with absolute certainty.",
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
    ));

    if !inputs.diary.is_empty() {
        sections.push(format!(
            "You have conducted the following actions:\n<context>\n{}\n</context>",
            inputs.diary.join("\n"),
        ));
    }

    let mut action_sections: Vec<String> = Vec::new();

    if inputs.gates.visit {
        let url_list = weighted_urls_to_string(inputs.weighted_urls, MAX_URLS_IN_PROMPT);
        let url_section = if url_list.is_empty() {
            String::new()
        } else {
            format!(
                "- Choose and visit relevant URLs below for more knowledge. higher weight \
                 suggests more relevant:\n<url-list>\n{url_list}\n</url-list>",
            )
        };
        action_sections.push(format!(
            "<action-visit>\n\
             - Crawl and read full content from URLs, you can get the fulltext, last updated \
             datetime etc of any URL.\n\
             - Must check URLs mentioned in <question> if any\n\
             {url_section}\n\
             </action-visit>",
        ));
    }

    if inputs.gates.search {
        let bad_requests = if inputs.all_keywords.is_empty() {
            String::new()
        } else {
            format!(
                "- Avoid those unsuccessful search requests and queries:\n<bad-requests>\n{}\n</bad-requests>",
                inputs.all_keywords.join("\n"),
            )
        };
        action_sections.push(format!(
            "<action-search>\n\
             - Use web search to find relevant information\n\
             - Build a search request based on the deep intention behind the original question \
             and the expected answer format\n\
             - Always prefer a single search request, only add another request if the original \
             question covers multiple aspects or elements and one query is not enough, each \
             request focus on one specific aspect of the original question\n\
             {bad_requests}\n\
             </action-search>",
        ));
    }

    if inputs.beast_mode {
        action_sections.push(
            "<action-answer>\n\
             PRIORITY OVERRIDE: answer NOW, with whatever you have.\n\
             - Any response is better than silence; hesitation is failure.\n\
             - Partial answers are authorized, deployed with full contextual support.\n\
             - Reusing material from the previous conversation is sanctioned.\n\
             - When in doubt: commit to the best-supported answer available.\n\
             Failure is not an option.\n\
             </action-answer>"
                .to_string(),
        );
    } else if inputs.gates.answer {
        action_sections.push(
            "<action-answer>\n\
             - For greetings, casual conversation, general knowledge questions answer directly \
             without references.\n\
             - If user ask you to retrieve previous messages or chat history, remember you do \
             have access to the chat history, answer directly without references.\n\
             - For all other questions, provide a verified answer with references. Each \
             reference must include exactQuote, url and datetime.\n\
             - You provide deep, unexpected insights, identifying hidden patterns and \
             connections, and creating \"aha moments\".\n\
             - You break conventional thinking, establish unique cross-disciplinary \
             connections, and bring new perspectives to the user.\n\
             - If uncertain, use <action-reflect>\n\
             </action-answer>"
                .to_string(),
        );
    }

    if inputs.gates.reflect {
        action_sections.push(
            "<action-reflect>\n\
             - Think slowly and planning lookahead. Examine <question>, <context>, previous \
             conversation with users to identify knowledge gaps.\n\
             - Reflect the gaps and plan a list key clarifying questions that deeply related \
             to the original question and lead to the answer\n\
             </action-reflect>"
                .to_string(),
        );
    }

    if inputs.gates.coding {
        action_sections.push(
            "<action-coding>\n\
             - This sandboxed coding environment helps you handle programming tasks like \
             counting, filtering, transforming, sorting, regex extraction, and data processing.\n\
             - Simply describe your problem in the \"codingIssue\" field. Include actual values \
             for small inputs or variable names for larger datasets.\n\
             - No code writing is required, senior engineers will handle the implementation.\n\
             </action-coding>"
                .to_string(),
        );
    }

    sections.push(format!(
        "Based on the current context, you must choose one of the following actions:\n\
         <actions>\n{}\n</actions>",
        action_sections.join("\n"),
    ));

    sections.push(
        "Think step by step, choose the action, and respond in valid JSON format matching \
         exact JSON schema of that action."
            .to_string(),
    );

    remove_extra_line_breaks(&sections.join("\n\n"))
}

/// Replay the knowledge base as (question, answer) turns.
pub fn build_msgs_from_knowledge(knowledge: &[KnowledgeItem]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(knowledge.len() * 2);
    for item in knowledge {
        messages.push(Message::user(item.question.trim()));

        let mut parts: Vec<String> = Vec::new();
        if let Some(updated) = &item.updated
            && matches!(item.kind, KnowledgeKind::Url | KnowledgeKind::SideInfo)
        {
            parts.push(format!("<answer-datetime>\n{updated}\n</answer-datetime>"));
        }
        if item.kind == KnowledgeKind::Url
            && let Some(first) = item.references.first()
        {
            parts.push(format!("<url>\n{}\n</url>", first.url));
        }
        parts.push(item.answer.clone());

        messages.push(Message::assistant(remove_extra_line_breaks(
            &parts.join("\n\n"),
        )));
    }
    messages
}

/// Full message chain for one step: knowledge turns, the prior conversation,
/// then the current question — prefixed with reviewer feedback when
/// re-answering the original question under a personal improvement plan.
pub fn compose_msgs(
    messages: &[Message],
    knowledge: &[KnowledgeItem],
    question: &str,
    final_answer_pip: Option<&[String]>,
) -> Vec<Message> {
    let mut msgs = build_msgs_from_knowledge(knowledge);
    msgs.extend(messages.iter().cloned());

    let user_content = match final_answer_pip.filter(|pip| !pip.is_empty()) {
        Some(pip) => {
            let reviewer_lines: String = pip
                .iter()
                .enumerate()
                .map(|(idx, p)| {
                    format!("<reviewer-{n}>\n{p}\n</reviewer-{n}>\n", n = idx + 1)
                })
                .collect();
            format!(
                "{question}\n\n\
                 <answer-requirements>\n\
                 - You provide deep, unexpected insights, identifying hidden patterns and \
                 connections, and creating \"aha moments\".\n\
                 - You break conventional thinking, establish unique cross-disciplinary \
                 connections, and bring new perspectives to the user.\n\
                 - Follow reviewer's feedback and improve your answer quality.\n\
                 {reviewer_lines}\
                 </answer-requirements>",
            )
        }
        None => question.to_string(),
    };

    msgs.push(Message::user(remove_extra_line_breaks(&user_content)));
    msgs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Reference;

    fn inputs<'a>(
        diary: &'a [String],
        keywords: &'a [String],
        urls: &'a [UrlSnippet],
        gates: GateVector,
        beast: bool,
    ) -> PromptInputs<'a> {
        PromptInputs {
            diary,
            all_keywords: keywords,
            weighted_urls: urls,
            gates,
            beast_mode: beast,
        }
    }

    #[test]
    fn full_prompt_has_all_action_blocks() {
        let prompt = compose_system_prompt(&inputs(&[], &[], &[], GateVector::all(), false));
        for block in [
            "<action-visit>",
            "<action-search>",
            "<action-answer>",
            "<action-reflect>",
            "<action-coding>",
        ] {
            assert!(prompt.contains(block), "missing {block}");
        }
        assert!(prompt.starts_with("Current date:"));
        assert!(!prompt.contains("<context>"));
    }

    #[test]
    fn gated_actions_are_omitted() {
        let gates = GateVector {
            search: false,
            visit: false,
            answer: true,
            reflect: true,
            coding: true,
        };
        let prompt = compose_system_prompt(&inputs(&[], &[], &[], gates, false));
        assert!(!prompt.contains("<action-search>"));
        assert!(!prompt.contains("<action-visit>"));
        assert!(prompt.contains("<action-answer>"));
    }

    #[test]
    fn diary_appears_in_context_block() {
        let diary = vec!["At step 1, you took the **search** action.".to_string()];
        let prompt = compose_system_prompt(&inputs(&diary, &[], &[], GateVector::all(), false));
        assert!(prompt.contains("<context>"));
        assert!(prompt.contains("**search**"));
    }

    #[test]
    fn keywords_render_as_bad_requests() {
        let keywords = vec!["capital of France".to_string()];
        let prompt =
            compose_system_prompt(&inputs(&[], &keywords, &[], GateVector::all(), false));
        assert!(prompt.contains("<bad-requests>"));
        assert!(prompt.contains("capital of France"));
    }

    #[test]
    fn url_list_shows_top_weighted() {
        let urls = vec![UrlSnippet {
            title: "t".into(),
            url: "https://a.com/".into(),
            description: "d".into(),
            weight: 3,
        }];
        let prompt = compose_system_prompt(&inputs(&[], &[], &urls, GateVector::all(), false));
        assert!(prompt.contains("<url-list>"));
        assert!(prompt.contains("https://a.com/ (3)"));
    }

    #[test]
    fn beast_mode_replaces_answer_block() {
        let prompt = compose_system_prompt(&inputs(
            &[],
            &[],
            &[],
            GateVector::answer_only(),
            true,
        ));
        assert!(prompt.contains("PRIORITY OVERRIDE"));
        assert!(!prompt.contains("For greetings, casual conversation"));
    }

    #[test]
    fn knowledge_turns_carry_datetime_and_url_tags() {
        let items = vec![
            KnowledgeItem::new("what is X?", "X is Y.", KnowledgeKind::Url)
                .with_references(vec![Reference {
                    url: "https://a.com/x".into(),
                    ..Default::default()
                }])
                .with_updated("2024-05-01"),
            KnowledgeItem::new("side q", "side a", KnowledgeKind::Qa).with_updated("2024-05-02"),
        ];
        let msgs = build_msgs_from_knowledge(&items);
        assert_eq!(msgs.len(), 4);
        assert!(msgs[1].content.contains("<answer-datetime>"));
        assert!(msgs[1].content.contains("<url>"));
        // qa items never get the datetime tag.
        assert!(!msgs[3].content.contains("<answer-datetime>"));
    }

    #[test]
    fn pip_prefixes_reviewer_feedback() {
        let pip = vec!["For the best answer, you must cite primary sources.".to_string()];
        let msgs = compose_msgs(&[], &[], "original question", Some(&pip));
        let last = &msgs.last().unwrap().content;
        assert!(last.contains("<answer-requirements>"));
        assert!(last.contains("<reviewer-1>"));
        assert!(last.contains("primary sources"));
    }

    #[test]
    fn no_pip_means_plain_question() {
        let msgs = compose_msgs(&[], &[], "original question", None);
        assert_eq!(msgs.last().unwrap().content, "original question");
    }

    #[test]
    fn remove_extra_line_breaks_collapses_blanks() {
        assert_eq!(
            remove_extra_line_breaks("a\n\n\n   \n  b  \nc"),
            "a\nb\nc"
        );
    }
}
