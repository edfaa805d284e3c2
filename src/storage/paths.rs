//! Key-scheme functions mapping images, repositories and tags to storage keys.

pub const TAG_PREFIX: &str = "tag_";
pub const DEFAULT_NAMESPACE: &str = "library";

pub fn image_json_path(id: &str) -> String {
    format!("images/{id}/json")
}

pub fn image_mark_path(id: &str) -> String {
    format!("images/{id}/_inprogress")
}

pub fn image_checksum_path(id: &str) -> String {
    format!("images/{id}/_checksum")
}

pub fn image_layer_path(id: &str) -> String {
    format!("images/{id}/layer")
}

pub fn image_ancestry_path(id: &str) -> String {
    format!("images/{id}/ancestry")
}

pub fn image_files_path(id: &str) -> String {
    format!("images/{id}/_files")
}

pub fn image_diff_path(id: &str) -> String {
    format!("images/{id}/_diff")
}

pub fn repo_path(namespace: &str, repo: &str) -> String {
    format!("repositories/{namespace}/{repo}")
}

/// An empty tag yields the repository directory itself.
pub fn repo_tag_path(namespace: &str, repo: &str, tag: &str) -> String {
    if tag.is_empty() {
        return repo_path(namespace, repo);
    }
    format!("repositories/{namespace}/{repo}/{TAG_PREFIX}{tag}")
}

pub fn repo_json_path(namespace: &str, repo: &str) -> String {
    format!("repositories/{namespace}/{repo}/json")
}

pub fn repo_tag_json_path(namespace: &str, repo: &str, tag: &str) -> String {
    format!("repositories/{namespace}/{repo}/tag{tag}_json")
}

pub fn repo_index_images_path(namespace: &str, repo: &str) -> String {
    format!("repositories/{namespace}/{repo}/_index_images")
}
