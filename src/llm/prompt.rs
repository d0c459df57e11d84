//! Prompt assembly and response parsing shared by all providers.

use super::{GenerationRequest, RefinementContext};

/// Cost per token as of early 2025: $3.00/M input, $15.00/M output.
const INPUT_COST_PER_TOKEN: f64 = 3.00 / 1_000_000.0;
const OUTPUT_COST_PER_TOKEN: f64 = 15.00 / 1_000_000.0;

pub fn build_prompt(request: &GenerationRequest) -> String {
    match &request.previous_attempt {
        Some(previous) => {
            build_refinement_prompt(&request.question, &request.schema_context, previous)
        }
        None => build_initial_prompt(&request.question, &request.schema_context),
    }
}

fn build_initial_prompt(question: &str, schema_context: &str) -> String {
    format!(
        r#"You are an expert SQL database assistant. Generate a SQL query based on the user's natural language question.

<database_schema>
{}
</database_schema>

<user_question>
{}
</user_question>

Instructions:
1. Generate a valid SQL query that answers the user's question
2. Use proper JOIN syntax when combining tables
3. Include appropriate WHERE clauses for filtering
4. Use meaningful column aliases when helpful
5. Optimize for readability and performance
6. Return reasonable result limits (use LIMIT when appropriate)

CRITICAL SAFETY RULES:
- NEVER generate DELETE, UPDATE, TRUNCATE, or DROP statements without explicit confirmation
- Always use WHERE clauses for UPDATE/DELETE operations
- Validate that the query is safe before returning it

Response format:
```sql
[Your SQL query here]
```

Explanation: [Brief explanation of what the query does and why you structured it this way]

Generate the SQL query now:"#,
        schema_context, question
    )
}

fn build_refinement_prompt(
    question: &str,
    schema_context: &str,
    previous: &RefinementContext,
) -> String {
    let refinement_block = match previous.user_note.as_deref() {
        Some(note) if !note.is_empty() => {
            format!("<user_refinement>{}</user_refinement>\n\n", note)
        }
        _ => String::new(),
    };

    format!(
        r#"You are an expert SQL database assistant. A previous SQL query failed and needs to be corrected.

<database_schema>
{}
</database_schema>

<original_question>
{}
</original_question>

<previous_sql>
{}
</previous_sql>

<error_message>
{}
</error_message>

{}Instructions:
1. Analyze the error message carefully
2. Correct the SQL query to fix the specific error
3. If user provided refinement, incorporate their feedback
4. Ensure the corrected query still answers the original question
5. Explain what was wrong and how you fixed it

Response format:
```sql
[Your corrected SQL query here]
```

Explanation: [Explain what was wrong with the previous query and how you fixed it]

Generate the corrected SQL query now:"#,
        schema_context,
        question,
        previous.previous_sql,
        previous.previous_error.as_deref().unwrap_or(""),
        refinement_block
    )
}

/// Pull the SQL body and the trailing explanation out of a model response.
/// Falls back to a canned explanation when none is present.
pub fn parse_response(response_text: &str) -> (String, String) {
    let mut sql_lines = Vec::new();
    let mut explanation_lines = Vec::new();
    let mut in_sql_block = false;
    let mut in_explanation = false;

    for line in response_text.trim().lines() {
        let trimmed = line.trim();

        // Detect SQL code block
        if trimmed.starts_with("```sql") {
            in_sql_block = true;
            continue;
        } else if trimmed == "```" && in_sql_block {
            in_sql_block = false;
            continue;
        }

        // Detect explanation section
        if trimmed.starts_with("Explanation:") {
            in_explanation = true;
            explanation_lines.push(trimmed.trim_start_matches("Explanation:").trim().to_string());
            continue;
        }

        if in_sql_block {
            sql_lines.push(line.to_string());
        } else if in_explanation {
            explanation_lines.push(trimmed.to_string());
        }
    }

    let sql = sql_lines.join("\n").trim().to_string();
    let explanation = explanation_lines.join(" ").trim().to_string();

    let explanation = if explanation.is_empty() {
        "SQL query generated to answer your question.".to_string()
    } else {
        explanation
    };

    (sql, explanation)
}

/// Estimated cost in USD of one generation call.
pub fn estimate_cost(input_tokens: u64, output_tokens: u64) -> f64 {
    input_tokens as f64 * INPUT_COST_PER_TOKEN + output_tokens as f64 * OUTPUT_COST_PER_TOKEN
}
