//! Branch names, slugs, and the short task tag used in epic titles and
//! pull-request prefixes.

use uuid::Uuid;

/// Maximum slug length in a branch name.
const MAX_SLUG_LEN: usize = 50;

/// Slugify a title: lowercase, collapse non-alphanumeric runs to a single
/// hyphen, trim leading/trailing hyphens, truncate to 50 characters without
/// leaving a trailing hyphen.
pub fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_hyphen = false;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    if out.len() > MAX_SLUG_LEN {
        out.truncate(MAX_SLUG_LEN);
        while out.ends_with('-') {
            out.pop();
        }
    }

    out
}

/// Branch name for a subtask: `<tracker-issue-id>-<slug(title)>`.
pub fn branch_name(issue_id: &str, title: &str) -> String {
    let slug = slug(title);
    if slug.is_empty() {
        issue_id.to_string()
    } else {
        format!("{issue_id}-{slug}")
    }
}

/// First eight characters of an identifier's simple (unhyphenated) form.
///
/// The planner tags epic titles with this so `find_epic_by_task_id` can
/// locate the epic after the run; pull-request titles carry the subtask's
/// tag as `[IV-<tag>]`.
pub fn short_tag(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Pull-request title for a subtask: `[IV-<8-char-subtask-id>] <title>`.
pub fn pr_title(subtask_id: Uuid, title: &str) -> String {
    format!("[IV-{}] {}", short_tag(subtask_id), title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_basic() {
        assert_eq!(slug("Add OAuth Handler"), "add-oauth-handler");
    }

    #[test]
    fn slug_collapses_special_character_runs() {
        assert_eq!(slug("Special @#$% Characters"), "special-characters");
    }

    #[test]
    fn slug_trims_edges() {
        assert_eq!(slug("--hello world--"), "hello-world");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn slug_truncates_without_trailing_hyphen() {
        // 50th char lands on a hyphen boundary; it must not survive.
        let title = "a".repeat(49) + " tail that gets cut off entirely";
        let s = slug(&title);
        assert!(s.len() <= 50);
        assert!(!s.ends_with('-'));
    }

    #[test]
    fn branch_name_concatenates() {
        assert_eq!(
            branch_name("iv-5", "Add OAuth Handler"),
            "iv-5-add-oauth-handler"
        );
    }

    #[test]
    fn branch_name_empty_slug_falls_back_to_issue() {
        assert_eq!(branch_name("iv-9", "???"), "iv-9");
    }

    #[test]
    fn short_tag_is_eight_chars() {
        let id = Uuid::new_v4();
        let tag = short_tag(id);
        assert_eq!(tag.len(), 8);
        assert!(id.simple().to_string().starts_with(&tag));
    }

    #[test]
    fn pr_title_format() {
        let id: Uuid = "0192aabb-ccdd-7eef-8899-001122334455".parse().unwrap();
        let title = pr_title(id, "Add OAuth Handler");
        assert_eq!(title, "[IV-0192aabb] Add OAuth Handler");
    }
}
