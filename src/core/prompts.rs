//! Fixed prompt templates, rendered with minijinja.

use minijinja::{Environment, Value, context};

const SYSTEM_PROMPT: &str = r#"You are an expert analyst that always answers questions with the most relevant information using the tools at your disposal.
These tools have information regarding documents that the user has expressed interest in.
Here are some guidelines that you must follow:
* For questions about the documents, you must use the tools to find the answer and then write a response.
* Even if it seems like your tools won't be able to answer the question, you must still use them to find the most relevant information and insights.
* You may assume that the user's questions are related to the documents they've selected.
* If your tools are unable to find an answer, you should say that you haven't found an answer but still relay any useful information the tools found.

The tools at your disposal have access to the following documents that the user has selected to discuss with you:
{{ doc_titles }}

The current date is: {{ curr_date }}
"#;

const SUB_QUESTION_PROMPT: &str = r#"You are a world class state of the art agent.

You have access to multiple tools, each representing a different data source or API.
Each of the tools has a name and a description, formatted as a JSON dictionary.
The keys of the dictionary are the names of the tools and the values are the descriptions.
Your purpose is to help answer a complex user question by generating a list of sub questions that can be answered by the tools.

These are the guidelines you consider when completing your task:
* Be as specific as possible
* The sub questions should be relevant to the user question
* The sub questions should be answerable by the tools provided
* You can only generate up to three sub questions for each tool
* Tools must be specified by their name, not their description
* You don't need to use a tool if you don't think it's relevant

Output the list of sub questions by calling the {{ function_name }} function.

## Tools
```json
{{ tools_str }}
```

## User Question
{{ query_str }}
"#;

const DOCUMENT_TOOL_DESCRIPTION: &str = "A document({{ name }}) containing useful information that the user pre-selected to discuss with the assistant.";

/// Description of the composite engine, as presented to the agent.
pub const QUALITATIVE_ENGINE_DESCRIPTION: &str = "A query engine that can answer qualitative questions about a set of documents that the user pre-selected for the conversation.
Any questions about company-related headwinds, tailwinds, risks, sentiments, or administrative information should be asked here.";

const TEXT_QA_PROMPT: &str = r#"Context information is below.
---------------------
{{ context_str }}
---------------------
Given the context information and not prior knowledge, answer the query.
Query: {{ query_str }}
Answer: "#;

const SUB_QUESTION_SYNTHESIS_PROMPT: &str = r#"The user selected the following documents for this conversation:
{{ doc_titles }}

Answers to sub questions derived from the user question are below.
---------------------
{% for item in qa_pairs %}
Sub question: {{ item.question }}
Response: {{ item.answer }}
{% endfor %}
---------------------
Using only the information above, answer the query. Mention which document each fact came from.
Query: {{ query_str }}
Answer: "#;

fn render(source: &str, ctx: Value) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.render_str(source, ctx)
}

/// Bullet list of document titles, or a placeholder when nothing is selected.
pub fn document_titles(display_names: &[String]) -> String {
    if display_names.is_empty() {
        return "No documents selected.".to_owned();
    }

    display_names
        .iter()
        .map(|name| format!("- {name}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn system_prompt(doc_titles: &str, curr_date: &str) -> Result<String, minijinja::Error> {
    render(
        SYSTEM_PROMPT,
        context! { doc_titles => doc_titles, curr_date => curr_date },
    )
}

pub fn sub_question_prompt(
    function_name: &str,
    tools_str: &str,
    query_str: &str,
) -> Result<String, minijinja::Error> {
    render(
        SUB_QUESTION_PROMPT,
        context! { function_name => function_name, tools_str => tools_str, query_str => query_str },
    )
}

pub fn document_tool_description(display_name: &str) -> Result<String, minijinja::Error> {
    render(DOCUMENT_TOOL_DESCRIPTION, context! { name => display_name })
}

pub fn text_qa_prompt(context_str: &str, query_str: &str) -> Result<String, minijinja::Error> {
    render(
        TEXT_QA_PROMPT,
        context! { context_str => context_str, query_str => query_str },
    )
}

pub fn sub_question_synthesis_prompt(
    doc_titles: &str,
    qa_pairs: &[(String, String)],
    query_str: &str,
) -> Result<String, minijinja::Error> {
    let qa_pairs: Vec<Value> = qa_pairs
        .iter()
        .map(|(question, answer)| context! { question => question, answer => answer })
        .collect();

    render(
        SUB_QUESTION_SYNTHESIS_PROMPT,
        context! { doc_titles => doc_titles, qa_pairs => qa_pairs, query_str => query_str },
    )
}
