//! Agent prompt construction.
//!
//! The agent never touches the checkout directly. It announces each action
//! as a line the output parser recognises, and the supervisor applies the
//! action after a permission check. The prompt teaches it that protocol.

/// Line protocol the agent must follow.
pub const PROTOCOL_INSTRUCTIONS: &str = "\
You cannot modify files or run commands yourself. Announce every action on its own line, \
exactly in one of these forms, and the harness will perform it for you:

Reading file: <path>
Writing to file: <path>
```<language>
<complete new file content>
```
Editing file: <path>
```diff
<unified diff against the current file, with --- a/<path> and +++ b/<path> headers>
```
$ <shell command to run from the repository root>

Paths are relative to the repository root. Leave a blank line after each action. \
Prefix reasoning with \"Thinking: \" and problems with \"Error: \". \
Do not commit, create branches or push: the harness commits your changes and opens the pull request.";

/// Appended when the repository has no ignore file.
pub const GITIGNORE_INSTRUCTION: &str = "\n\nThe repository has no .gitignore. \
Before finishing, write one that excludes keys, credentials, .env files, temporary files, \
build artifacts, downloaded dependencies, editor/ide files, OS files for mac/windows/linux \
and log files for this project.";

/// Checks if a prompt mentions gitignore (case-insensitive).
pub fn prompt_mentions_gitignore(prompt: &str) -> bool {
    prompt.to_lowercase().contains("gitignore")
}

/// Appends [`GITIGNORE_INSTRUCTION`] when the repository lacks a `.gitignore`
/// and the user did not already ask about one.
pub fn augment_prompt_with_gitignore(prompt: &str, has_gitignore: bool) -> String {
    if has_gitignore {
        tracing::debug!("repository has .gitignore, not augmenting prompt");
        return prompt.to_string();
    }

    if prompt_mentions_gitignore(prompt) {
        tracing::debug!("prompt mentions gitignore, not augmenting");
        return prompt.to_string();
    }

    tracing::info!("repository has no .gitignore, asking the agent for one");
    format!("{}{}", prompt, GITIGNORE_INSTRUCTION)
}

/// Builds the full prompt handed to the agent CLI.
pub fn build_agent_prompt(task: &str, repo_name: &str, has_gitignore: bool) -> String {
    let task = augment_prompt_with_gitignore(task.trim(), has_gitignore);
    format!(
        "You are working in a checkout of the {} repository.\n\n{}\n\nTask: {}",
        repo_name, PROTOCOL_INSTRUCTIONS, task
    )
}
