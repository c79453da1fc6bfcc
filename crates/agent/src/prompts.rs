//! Prompt templates.
//!
//! A [`PromptRenderer`] turns a [`PromptRole`] plus a [`PromptContext`] into
//! text. [`TemplateSet`] is the built-in renderer: one closure per role, any
//! of which can be replaced. The system prompt describes the active grammar
//! using the grammar's own prefixes, so every dialect documents itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepwise_core::ToolDefinition;
use stepwise_grammar::{Grammar, ParsedNode, keys};

/// Every text the orchestrator renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptRole {
    System,
    User,
    /// The user sent an empty or whitespace-only message.
    UserEmpty,
    /// Completed nodes written back as the model's own message.
    Assistant,
    SchemaError,
    ToolNotFound,
    ToolInputError,
    ToolError,
    ToolNoResult,
}

impl PromptRole {
    pub const ALL: [PromptRole; 9] = [
        PromptRole::System,
        PromptRole::User,
        PromptRole::UserEmpty,
        PromptRole::Assistant,
        PromptRole::SchemaError,
        PromptRole::ToolNotFound,
        PromptRole::ToolInputError,
        PromptRole::ToolError,
        PromptRole::ToolNoResult,
    ];
}

/// Everything a template may draw on.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub grammar: &'a Grammar,
    pub tools: &'a [ToolDefinition],
    pub input: &'a str,
    pub nodes: &'a [ParsedNode],
    /// Error text for the feedback roles.
    pub reason: &'a str,
    pub instructions: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

impl<'a> PromptContext<'a> {
    pub fn new(grammar: &'a Grammar, tools: &'a [ToolDefinition]) -> Self {
        Self {
            grammar,
            tools,
            input: "",
            nodes: &[],
            reason: "",
            instructions: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: &'a str) -> Self {
        self.input = input;
        self
    }

    pub fn with_nodes(mut self, nodes: &'a [ParsedNode]) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_reason(mut self, reason: &'a str) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<&'a str>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `prefix` of `key` in the active grammar, or `key` itself.
    fn prefix(&self, key: &'a str) -> &'a str {
        self.grammar.prefix_of(key).unwrap_or(key)
    }
}

/// Renders prompt text for a role.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, role: PromptRole, ctx: &PromptContext<'_>) -> String;
}

pub type Template = Arc<dyn Fn(&PromptContext<'_>) -> String + Send + Sync>;

/// Closure-per-role renderer.
#[derive(Clone)]
pub struct TemplateSet {
    templates: HashMap<PromptRole, Template>,
}

impl TemplateSet {
    /// Templates worded for the default dialect.
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
        .with_template(PromptRole::System, |ctx| {
            system_prompt("You are a helpful assistant.", ctx)
        })
        .with_template(PromptRole::User, |ctx| format!("Message: {}", ctx.input))
        .with_template(PromptRole::UserEmpty, |_| "Message: Empty message.".to_string())
        .with_template(PromptRole::Assistant, assistant_message)
        .with_template(PromptRole::SchemaError, schema_error)
        .with_template(PromptRole::ToolNotFound, tool_not_found)
        .with_template(PromptRole::ToolInputError, |ctx| {
            format!(
                "{}\n\nHINT: If you're convinced that the input was correct but the tool \
                 cannot process it then use a different tool or say I don't know.",
                ctx.reason
            )
        })
        .with_template(PromptRole::ToolError, |ctx| {
            format!(
                "The tool has failed; the error log is shown below. If the tool cannot \
                 accomplish what you want, use a different tool or explain why you can't \
                 use it.\n\n{}",
                ctx.reason
            )
        })
        .with_template(PromptRole::ToolNoResult, |_| {
            "No results were found!\nTry to reformat your input or use a different tool."
                .to_string()
        })
    }

    /// Templates worded for Granite models, which expect the bare message.
    pub fn granite() -> Self {
        Self::new()
            .with_template(PromptRole::System, |ctx| {
                system_prompt(
                    "You are an AI assistant.\nWhen the user sends a message figure out a \
                     solution and provide a final answer.",
                    ctx,
                )
            })
            .with_template(PromptRole::User, |ctx| ctx.input.to_string())
            .with_template(PromptRole::UserEmpty, |_| "Empty message.".to_string())
    }

    /// Templates for a named dialect; unknown names get the defaults.
    pub fn for_dialect(dialect: &str) -> Self {
        match dialect {
            "granite" => Self::granite(),
            _ => Self::new(),
        }
    }

    /// Replace the template for one role.
    pub fn with_template<F>(mut self, role: PromptRole, template: F) -> Self
    where
        F: Fn(&PromptContext<'_>) -> String + Send + Sync + 'static,
    {
        self.templates.insert(role, Arc::new(template));
        self
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer for TemplateSet {
    fn render(&self, role: PromptRole, ctx: &PromptContext<'_>) -> String {
        self.templates
            .get(&role)
            .map(|template| template(ctx))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roles: Vec<_> = PromptRole::ALL
            .iter()
            .filter(|r| self.templates.contains_key(*r))
            .collect();
        f.debug_struct("TemplateSet").field("roles", &roles).finish()
    }
}

// --- Built-in templates ---

fn system_prompt(persona: &str, ctx: &PromptContext<'_>) -> String {
    let mut out = String::from(persona);
    out.push_str("\n\n");

    if ctx.tools.is_empty() {
        out.push_str("# Tools\nNo tools are available. Answer from your own knowledge.\n\n");
    } else {
        out.push_str(
            "# Tools\nTools must be used to retrieve factual or current information. \
             Pay close attention to each tool's description to decide whether it is useful.\n\n\
             ## Available tools\n",
        );
        for tool in ctx.tools {
            out.push_str(&format!(
                "### {}\nDescription: {}\nInput Schema: {}\n\n",
                tool.name, tool.description, tool.parameters
            ));
        }
    }

    out.push_str(&communication_structure(ctx));

    out.push_str(
        "\n# Best practices\n\
         - Never invent a tool response; wait for it.\n\
         - When a tool fails, check your input or use a different tool.\n\
         - Use markdown to format code, tables, links and JSON in the final answer.\n\
         - If you cannot answer, say that you don't know.\n",
    );

    out.push_str(&format!(
        "\n# Date and Time\nThe current date and time is: {} UTC\n",
        ctx.timestamp.format("%A, %B %-d, %Y %H:%M:%S")
    ));

    if let Some(instructions) = ctx.instructions.filter(|i| !i.trim().is_empty()) {
        out.push_str(&format!("\n# Additional instructions\n{}\n", instructions.trim()));
    }
    out
}

/// The grammar, in words.
fn communication_structure(ctx: &PromptContext<'_>) -> String {
    let grammar = ctx.grammar;
    let mut out = String::from(
        "# Communication structure\n\
         You communicate only in instruction lines. The format is: \"Instruction: expected output\". \
         You must only use these instruction lines and must not enter empty lines or anything \
         else between instruction lines.\n",
    );
    out.push_str(&format!(
        "Every response starts with '{}'.\n\n",
        grammar.entry().prefix
    ));

    for node in grammar.nodes().iter().filter(|n| n.key != keys::TOOL_OUTPUT) {
        out.push_str(&format!("{} {}\n", node.prefix, describe(&node.key)));
    }
    out.push('\n');

    for node in grammar.nodes().iter().filter(|n| !n.next.is_empty()) {
        let next: Vec<String> = node
            .next
            .iter()
            .map(|k| format!("'{}'", ctx.prefix(k)))
            .collect();
        out.push_str(&format!("'{}' is followed by {}.\n", node.prefix, next.join(" or ")));
    }

    if let (Some(input), Some(output)) = (
        grammar.prefix_of(keys::TOOL_INPUT),
        grammar.prefix_of(keys::TOOL_OUTPUT),
    ) {
        out.push_str(&format!(
            "'{input}' ends your response. The next message starts with '{output}' and holds \
             the tool response.\n"
        ));
    }
    if let Some(answer) = grammar.prefix_of(keys::FINAL_ANSWER) {
        out.push_str(&format!("'{answer}' ends the conversation.\n"));
    }
    out
}

fn describe(key: &str) -> &'static str {
    match key {
        keys::THOUGHT => "short plain-text reasoning about what to do next.",
        keys::TOOL_NAME => "the name of one of the available tools.",
        keys::TOOL_INPUT => {
            "the tool input as one line of JSON matching the tool's input schema, \
             i.e. {\"arg1\":\"value1\",\"arg2\":\"value2\"}."
        }
        keys::FINAL_ANSWER => "a concise and complete answer to the user's message.",
        _ => "free text.",
    }
}

fn assistant_message(ctx: &PromptContext<'_>) -> String {
    ctx.nodes
        .iter()
        .map(|node| format!("{} {}", ctx.prefix(&node.key), node.value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn schema_error(ctx: &PromptContext<'_>) -> String {
    let valid: Vec<String> = ctx
        .grammar
        .nodes()
        .iter()
        .filter(|n| n.key != keys::TOOL_OUTPUT)
        .map(|n| format!("'{}'", n.prefix))
        .collect();
    let mut out = format!(
        "Error: The generated response does not adhere to the communication structure \
         mentioned in the system prompt.\nYou communicate only in instruction lines. \
         Valid instruction lines are {}.",
        valid.join(", ")
    );
    if !ctx.reason.is_empty() {
        out.push_str(&format!("\n\nDetails: {}", ctx.reason));
    }
    out
}

fn tool_not_found(ctx: &PromptContext<'_>) -> String {
    if ctx.tools.is_empty() {
        return "Tool does not exist!\nNo tools are available; answer without them.".to_string();
    }
    let names: Vec<&str> = ctx.tools.iter().map(|t| t.name.as_str()).collect();
    format!(
        "Tool does not exist!\nUse one of the following tools: {}",
        names.join(",")
    )
}
