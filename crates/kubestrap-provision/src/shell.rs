//! Shell fragments shared by the steps

use kubestrap_core::{StepContext, StepError};
use kubestrap_exec::ShellCommand;
use kubestrap_exec::command::quote;

/// curl's exit status for an HTTP error response under `-f`
const CURL_HTTP_ERROR: i32 = 22;

/// Wrap a shell condition so it exits 0 when true and 1 otherwise
pub(crate) fn check(ctx: &StepContext<'_>, condition: &str) -> ShellCommand {
    ctx.script(format!("if {condition}; then exit 0; else exit 1; fi"))
}

/// Evaluate a shell condition on the host
pub(crate) async fn holds(ctx: &StepContext<'_>, condition: &str) -> Result<bool, StepError> {
    ctx.probe(&check(ctx, condition)).await
}

/// Condition: `path` holds exactly `content`
pub(crate) fn content_matches(path: &str, content: &str) -> String {
    format!(
        "printf '%s' {} | cmp -s - {}",
        quote(content),
        quote(path)
    )
}

/// Script replacing `path` with `content`, creating its directory
pub(crate) fn write_file(path: &str, content: &str, mode: &str) -> String {
    let dir = path.rsplit_once('/').map_or(".", |(dir, _)| if dir.is_empty() { "/" } else { dir });
    format!(
        "install -d -m 0755 {dir} && printf '%s' {content} > {path} && chmod {mode} {path}",
        dir = quote(dir),
        content = quote(content),
        path = quote(path),
        mode = quote(mode),
    )
}

/// Download `url` to `dest` on the host with curl
///
/// # Errors
/// `Download` when the server answers with an HTTP error or curl fails
pub(crate) async fn download(
    ctx: &StepContext<'_>,
    url: &str,
    dest: &str,
) -> Result<(), StepError> {
    let command = ctx
        .command("curl")
        .args(["-fsSL", "--retry", "2", "-o", dest, url]);
    let result = ctx.exec(&command).await?;
    match result.status {
        0 => Ok(()),
        CURL_HTTP_ERROR => Err(StepError::Download {
            url: url.to_string(),
            reason: format!("HTTP error: {}", result.stderr.trim()),
        }),
        status => Err(StepError::Download {
            url: url.to_string(),
            reason: format!("curl exited with {status}: {}", result.stderr.trim()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_matches_quotes() {
        assert_eq!(
            content_matches("/etc/x.conf", "a b\n"),
            "printf '%s' 'a b\n' | cmp -s - /etc/x.conf"
        );
    }

    #[test]
    fn test_write_file() {
        assert_eq!(
            write_file("/etc/modules-load.d/k8s.conf", "overlay\n", "0644"),
            "install -d -m 0755 /etc/modules-load.d && printf '%s' 'overlay\n' > /etc/modules-load.d/k8s.conf && chmod 0644 /etc/modules-load.d/k8s.conf"
        );
    }
}
