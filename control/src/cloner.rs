//! In-pod Git clone orchestration. After a successful readiness wait the
//! engine execs a shell script inside the agent container; the Git token is
//! consumed from the pod environment through a credential helper and never
//! appears on a command line.

use crate::error::ApiError;
use crate::orchestrator::Orchestrator;

/// Inline credential helper reading `GIT_TOKEN` from the environment.
const CREDENTIAL_HELPER: &str =
    "!f() { echo username=x-access-token; echo \"password=${GIT_TOKEN}\"; }; f";

#[derive(Debug)]
pub struct CloneFailure {
    pub exit_code: i32,
    pub detail: String,
}

/// Shell-quote a value for safe interpolation into the clone script.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds the idempotent clone-or-update script. A checkout whose origin
/// matches the project's repo URL is fast-forwarded; anything else is
/// replaced with a fresh shallow clone.
pub fn clone_script(workspace_dir: &str, repo_url: &str) -> String {
    let dir = shell_quote(workspace_dir);
    let url = shell_quote(repo_url);
    let helper = shell_quote(CREDENTIAL_HELPER);
    format!(
        r#"set -e
mkdir -p {dir}
cd {dir}
if [ -d repo/.git ] && [ "$(git -C repo config --get remote.origin.url)" = {url} ]; then
    git -C repo -c credential.helper={helper} pull --ff-only
else
    rm -rf repo
    git -c credential.helper={helper} clone --depth 1 {url} repo
fi
"#
    )
}

/// Run the clone inside the project's pod. Failure is reported, not raised
/// into the project lifecycle: the agent stays usable without the repo.
pub async fn clone_repository(
    orch: &Orchestrator,
    namespace: &str,
    selector: &str,
    workspace_dir: &str,
    repo_url: &str,
) -> Result<Result<(), CloneFailure>, ApiError> {
    let script = clone_script(workspace_dir, repo_url);
    let output = orch
        .exec_in_pod(namespace, selector, &["sh", "-c", script.as_str()], None)
        .await?;
    if output.exit_code == 0 {
        tracing::info!(namespace, selector, repo_url, "repository clone succeeded");
        Ok(Ok(()))
    } else {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        tracing::warn!(
            namespace,
            selector,
            exit_code = output.exit_code,
            "repository clone failed"
        );
        Ok(Err(CloneFailure {
            exit_code: output.exit_code,
            detail,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_contains_no_token_material() {
        let script = clone_script("/workspace", "https://github.com/acme/app.git");
        // the token is referenced only through the environment
        assert!(script.contains("${GIT_TOKEN}"));
        assert!(!script.contains("ghp_"));
    }

    #[test]
    fn script_quotes_hostile_paths() {
        let script = clone_script("/work'space", "https://github.com/acme/app.git");
        assert!(script.contains(r"'/work'\''space'"));
    }

    #[test]
    fn script_updates_matching_checkout_and_replaces_mismatched() {
        let script = clone_script("/workspace", "https://github.com/acme/app.git");
        assert!(script.contains("pull --ff-only"));
        assert!(script.contains("rm -rf repo"));
        assert!(script.contains("clone --depth 1"));
    }
}
