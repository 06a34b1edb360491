//! Path addressing: `/{process}` addresses a process manager and
//! `/{process}/{action}` a route served inside that process.

/// Address of a process manager
pub fn process_path(tag: &str) -> String {
    format!("/{}", tag.trim_matches('/'))
}

/// Address of an action served by a process or one of its units
pub fn action_path(tag: &str, action: &str) -> String {
    format!("/{}/{}", tag.trim_matches('/'), action.trim_matches('/'))
}
