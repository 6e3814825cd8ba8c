//! SQLite schema for agent run storage

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_debug_logs (
    project_id        TEXT NOT NULL,
    run_id            TEXT NOT NULL,
    agent_name        TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    ended_at          TEXT,
    status            TEXT NOT NULL,
    total_cost_usd    REAL NOT NULL DEFAULT 0,
    wasted_spend_usd  REAL NOT NULL DEFAULT 0,
    amount_saved_usd  REAL NOT NULL DEFAULT 0,
    cache_hit_rate    REAL NOT NULL DEFAULT 0,
    flags_json        TEXT NOT NULL DEFAULT '[]',
    opportunities_json TEXT NOT NULL DEFAULT '[]',
    user_id           TEXT,
    created_at        TEXT NOT NULL,
    PRIMARY KEY (project_id, run_id)
);

CREATE TABLE IF NOT EXISTS agent_debug_steps (
    project_id          TEXT NOT NULL,
    run_id              TEXT NOT NULL,
    step_index          INTEGER NOT NULL,
    timestamp           TEXT NOT NULL,
    step_type           TEXT NOT NULL,
    summary             TEXT,
    decision            TEXT,
    tool                TEXT,
    tool_args_json      TEXT,
    tool_output_summary TEXT,
    raw                 TEXT,
    token_cost          INTEGER,
    api_cost_usd        REAL,
    cache_hit           INTEGER,
    PRIMARY KEY (project_id, run_id, step_index)
);

CREATE TABLE IF NOT EXISTS agent_debug_explanations (
    project_id  TEXT NOT NULL,
    run_id      TEXT NOT NULL,
    step_index  INTEGER NOT NULL,
    explanation TEXT NOT NULL,
    confidence  REAL NOT NULL,
    source      TEXT NOT NULL,
    PRIMARY KEY (project_id, run_id, step_index)
);

CREATE INDEX IF NOT EXISTS idx_agent_logs_created
    ON agent_debug_logs (created_at);

CREATE INDEX IF NOT EXISTS idx_agent_steps_run
    ON agent_debug_steps (project_id, run_id);
"#;
