use anyhow::Result;
use sqlx::SqlitePool;

use story_trim_core::models::{Prompt, PromptKind};
use story_trim_core::prompt::DEFAULT_SUMMARY_INSTRUCTION;
use story_trim_core::store::PromptStore;

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS raw_contents (
            fingerprint TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            char_count INTEGER NOT NULL,
            token_estimate INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            title TEXT NOT NULL,
            content_fingerprint TEXT NOT NULL,
            book_fingerprint TEXT NOT NULL,
            total_chapters INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL,
            chapter_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(book_id, chapter_index),
            FOREIGN KEY (book_id) REFERENCES books(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            template TEXT NOT NULL,
            target_ratio_min REAL NOT NULL,
            target_ratio_max REAL NOT NULL,
            boundary_ratio_min REAL,
            boundary_ratio_max REAL,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_system INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS trim_results (
            fingerprint TEXT NOT NULL,
            prompt_id INTEGER NOT NULL,
            prompt_version INTEGER NOT NULL,
            level INTEGER NOT NULL,
            trimmed_text TEXT NOT NULL,
            trimmed_chars INTEGER NOT NULL,
            ratio REAL NOT NULL,
            tokens_consumed INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, prompt_id, prompt_version, level)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS chapter_summaries (
            book_fingerprint TEXT NOT NULL,
            chapter_index INTEGER NOT NULL,
            chapter_fingerprint TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (book_fingerprint, chapter_index)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS encyclopedias (
            book_fingerprint TEXT NOT NULL,
            range_end INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (book_fingerprint, range_end)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_processed_chapters (
            user_id INTEGER NOT NULL,
            book_id INTEGER NOT NULL,
            chapter_id INTEGER NOT NULL,
            prompt_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, book_id, chapter_id, prompt_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS reading_progress (
            user_id INTEGER NOT NULL,
            book_id INTEGER NOT NULL,
            last_chapter_id INTEGER NOT NULL,
            last_prompt_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, book_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            user_id INTEGER,
            book_id INTEGER NOT NULL,
            prompt_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            elapsed_ms INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_items (
            task_id TEXT NOT NULL,
            chapter_id INTEGER NOT NULL,
            chapter_index INTEGER NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (task_id, chapter_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_books_user_id ON books(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_chapters_book_id ON chapters(book_id)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_book_id ON tasks(book_id)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}

/// Prompts shipped with every installation.
pub fn builtin_prompts() -> Vec<Prompt> {
    let trim = |name: &str, description: &str, template: &str, target: (f64, f64), boundary: (f64, f64), is_default: bool| Prompt {
        id: 0,
        name: name.to_string(),
        description: description.to_string(),
        kind: PromptKind::Trim,
        version: 1,
        template: template.to_string(),
        target_ratio_min: target.0,
        target_ratio_max: target.1,
        boundary_ratio_min: Some(boundary.0),
        boundary_ratio_max: Some(boundary.1),
        is_default,
        is_system: true,
    };

    vec![
        trim(
            "standard",
            "Balanced condensation for everyday reading",
            "Cut filler descriptions and repeated exposition. Keep every line of dialogue verbatim.",
            (0.50, 0.60),
            (0.45, 0.65),
            true,
        ),
        trim(
            "light",
            "Gentle trim that keeps most of the prose",
            "Only remove obvious padding and repetition. Preserve descriptive passages and pacing.",
            (0.75, 0.85),
            (0.70, 0.90),
            false,
        ),
        trim(
            "speed",
            "Aggressive condensation for catching up quickly",
            "Keep only plot-relevant events and decisions, with all dialogue verbatim. Compress scenery and inner monologue to a sentence.",
            (0.25, 0.35),
            (0.20, 0.40),
            false,
        ),
        Prompt {
            id: 0,
            name: "summary".to_string(),
            description: "Chapter synopsis used for progressive memory".to_string(),
            kind: PromptKind::Summary,
            version: 1,
            template: DEFAULT_SUMMARY_INSTRUCTION.to_string(),
            target_ratio_min: 0.0,
            target_ratio_max: 0.0,
            boundary_ratio_min: None,
            boundary_ratio_max: None,
            is_default: true,
            is_system: true,
        },
    ]
}

/// Insert the built-in prompts that are missing. Existing rows are left as is.
pub async fn seed_prompts(store: &dyn PromptStore) -> Result<Vec<Prompt>> {
    let mut seeded = Vec::new();
    for prompt in builtin_prompts() {
        seeded.push(store.ensure_prompt(&prompt).await?);
    }
    Ok(seeded)
}
