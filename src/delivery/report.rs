//! The notification sent when a work item reaches a terminal status.

use crate::api::types::PendingTask;
use crate::state_machine::ExecutionResult;

const NO_OUTPUT: &str = "No output generated";

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render(task: &PendingTask, result: &ExecutionResult, has_attachment: bool) -> Report {
    let subject = if result.success {
        "Your AI Task is Complete"
    } else {
        "AI Task Update"
    }
    .to_string();

    let output = if result.output.trim().is_empty() {
        NO_OUTPUT
    } else {
        result.output.as_str()
    };
    let crypto = task
        .expected_amount
        .map(|a| format!("{a:.9} SOL"))
        .unwrap_or_else(|| "N/A".to_string());

    let mut text = format!(
        "WorkHero - Task {status}\n\nYour Task:\n{description}\n\n\
         Time Allocated: {minutes} minutes\nCost: ${cost:.2} ({crypto})\n\nResult:\n{output}\n",
        status = if result.success { "Completed" } else { "Update" },
        description = task.task_description,
        minutes = task.max_minutes,
        cost = task.cost_fiat,
    );
    if let Some(error) = &result.error {
        text.push_str(&format!("\nErrors: {error}\n"));
    }
    if has_attachment {
        text.push_str("\nNote: Generated files are attached as a ZIP archive.\n");
    }

    let accent = if result.success { "#14f195" } else { "#ff6b6b" };
    let errors = result
        .error
        .as_deref()
        .map(|e| {
            format!(
                r#"<p style="color: #ff6b6b;"><strong>Errors:</strong> {}</p>"#,
                escape_html(e)
            )
        })
        .unwrap_or_default();
    let attachment_note = if has_attachment {
        r#"<div class="task"><h3>Attachments</h3><p>Your generated files are attached as a ZIP archive.</p></div>"#
    } else {
        ""
    };

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <style>
    body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; }}
    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
    .task {{ background: #fff; padding: 20px; border-radius: 8px; margin-bottom: 20px; border-left: 4px solid #00d4ff; }}
    .result {{ background: #fff; padding: 20px; border-radius: 8px; border-left: 4px solid {accent}; }}
    .result pre {{ background: #1a1a2e; color: #fff; padding: 15px; border-radius: 8px; white-space: pre-wrap; }}
  </style>
</head>
<body>
  <div class="container">
    <h2>{heading}</h2>
    <div class="task">
      <h3>Your Task</h3>
      <p>{description}</p>
      <p><strong>Time Allocated:</strong> {minutes} minutes</p>
      <p><strong>Cost:</strong> ${cost:.2} ({crypto})</p>
    </div>
    <div class="result">
      <h3>Result</h3>
      <pre>{output}</pre>
      {errors}
    </div>
    {attachment_note}
  </div>
</body>
</html>
"#,
        heading = if result.success {
            "Task Completed Successfully!"
        } else {
            "Task Update"
        },
        description = escape_html(&task.task_description).replace('\n', "<br>"),
        minutes = task.max_minutes,
        cost = task.cost_fiat,
        output = escape_html(output),
    );

    Report {
        subject,
        text,
        html,
    }
}
