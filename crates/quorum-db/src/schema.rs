// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::Connection;

/// Idempotent schema migration.  Every statement is `IF NOT EXISTS`, so
/// re-running on an existing database is a no-op.
pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            model               TEXT NOT NULL DEFAULT '',
            default_project_id  TEXT,
            wallet_address      TEXT,
            algochat_enabled    INTEGER NOT NULL DEFAULT 0,
            algochat_auto       INTEGER NOT NULL DEFAULT 0,
            tool_permissions    TEXT,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            path       TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            project_id        TEXT REFERENCES projects(id) ON DELETE SET NULL,
            agent_id          TEXT NOT NULL,
            name              TEXT NOT NULL DEFAULT '',
            status            TEXT NOT NULL DEFAULT 'created',
            source            TEXT NOT NULL DEFAULT 'web',
            initial_prompt    TEXT NOT NULL DEFAULT '',
            pid               INTEGER,
            total_cost_usd    REAL NOT NULL DEFAULT 0,
            total_algo_spent  INTEGER NOT NULL DEFAULT 0,
            total_turns       INTEGER NOT NULL DEFAULT 0,
            credits_consumed  REAL NOT NULL DEFAULT 0,
            council_launch_id TEXT,
            council_role      TEXT,
            work_dir          TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_launch ON sessions(council_launch_id);

        CREATE TABLE IF NOT EXISTS session_messages (
            row_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            cost_usd   REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_messages_session
            ON session_messages(session_id, row_id);

        CREATE TABLE IF NOT EXISTS algochat_conversations (
            id               TEXT PRIMARY KEY,
            participant_addr TEXT NOT NULL UNIQUE,
            agent_id         TEXT,
            session_id       TEXT REFERENCES sessions(id) ON DELETE SET NULL,
            last_round       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS councils (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            description       TEXT NOT NULL DEFAULT '',
            member_agent_ids  TEXT NOT NULL,
            chairman_agent_id TEXT,
            discussion_rounds INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS council_launches (
            id         TEXT PRIMARY KEY,
            council_id TEXT NOT NULL REFERENCES councils(id),
            project_id TEXT,
            prompt     TEXT NOT NULL,
            stage      TEXT NOT NULL DEFAULT 'queued',
            synthesis  TEXT,
            error      TEXT,
            member_agent_ids  TEXT NOT NULL,
            chairman_agent_id TEXT,
            discussion_rounds INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS council_discussion_messages (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            launch_id  TEXT NOT NULL REFERENCES council_launches(id) ON DELETE CASCADE,
            agent_id   TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            round      INTEGER NOT NULL,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_discussion_launch
            ON council_discussion_messages(launch_id, round, id);

        CREATE TABLE IF NOT EXISTS workflows (
            id                 TEXT PRIMARY KEY,
            agent_id           TEXT,
            name               TEXT NOT NULL,
            status             TEXT NOT NULL DEFAULT 'draft',
            default_project_id TEXT,
            max_concurrency    INTEGER NOT NULL DEFAULT 1,
            nodes              TEXT NOT NULL,
            edges              TEXT NOT NULL,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id               TEXT PRIMARY KEY,
            workflow_id      TEXT NOT NULL REFERENCES workflows(id),
            status           TEXT NOT NULL DEFAULT 'running',
            input            TEXT,
            output           TEXT,
            snapshot_nodes   TEXT NOT NULL,
            snapshot_edges   TEXT NOT NULL,
            current_node_ids TEXT NOT NULL DEFAULT '[]',
            error            TEXT,
            started_at       TEXT NOT NULL,
            completed_at     TEXT
        );

        CREATE TABLE IF NOT EXISTS workflow_node_runs (
            id           TEXT PRIMARY KEY,
            run_id       TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
            node_id      TEXT NOT NULL,
            node_type    TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            input        TEXT,
            output       TEXT,
            session_id   TEXT,
            work_task_id TEXT,
            error        TEXT,
            started_at   TEXT,
            completed_at TEXT,
            UNIQUE(run_id, node_id)
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id              TEXT PRIMARY KEY,
            agent_id        TEXT,
            name            TEXT NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'active',
            cron_expression TEXT,
            interval_ms     INTEGER,
            actions         TEXT NOT NULL,
            approval_policy TEXT NOT NULL DEFAULT 'auto',
            next_run_at     TEXT,
            execution_count INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedule_executions (
            id          TEXT PRIMARY KEY,
            schedule_id TEXT NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
            action_type TEXT NOT NULL,
            session_id  TEXT,
            outcome     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS psk_contacts (
            id             TEXT PRIMARY KEY,
            nickname       TEXT NOT NULL,
            network        TEXT NOT NULL,
            psk            TEXT NOT NULL,
            mobile_address TEXT,
            active         INTEGER NOT NULL DEFAULT 1,
            created_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS algochat_psk_state (
            address    TEXT PRIMARY KEY,
            network    TEXT NOT NULL,
            state      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS health_snapshots (
            id            TEXT PRIMARY KEY,
            agent_id      TEXT NOT NULL,
            project_id    TEXT NOT NULL,
            tsc_errors    INTEGER NOT NULL DEFAULT 0,
            test_failures INTEGER NOT NULL DEFAULT 0,
            todos         INTEGER NOT NULL DEFAULT 0,
            fixmes        INTEGER NOT NULL DEFAULT 0,
            hacks         INTEGER NOT NULL DEFAULT 0,
            large_files   INTEGER NOT NULL DEFAULT 0,
            outdated_deps INTEGER NOT NULL DEFAULT 0,
            tsc_passed    INTEGER NOT NULL DEFAULT 0,
            tests_passed  INTEGER NOT NULL DEFAULT 0,
            collected_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_health_agent_project
            ON health_snapshots(agent_id, project_id, collected_at DESC);

        CREATE TABLE IF NOT EXISTS notifications (
            id         TEXT PRIMARY KEY,
            agent_id   TEXT NOT NULL,
            session_id TEXT,
            title      TEXT,
            message    TEXT NOT NULL,
            level      TEXT NOT NULL DEFAULT 'info',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notification_channels (
            id           TEXT PRIMARY KEY,
            agent_id     TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            config       TEXT NOT NULL,
            enabled      INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS work_tasks (
            id          TEXT PRIMARY KEY,
            agent_id    TEXT,
            description TEXT NOT NULL,
            branch      TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'created',
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_balances (
            address    TEXT PRIMARY KEY,
            balance    REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_transactions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            address    TEXT NOT NULL,
            amount     REAL NOT NULL,
            reason     TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_tx_address
            ON credit_transactions(address, id DESC);

        CREATE TABLE IF NOT EXISTS credit_config (
            id               INTEGER PRIMARY KEY CHECK (id = 1),
            enabled          INTEGER NOT NULL DEFAULT 1,
            credits_per_turn REAL NOT NULL DEFAULT 100,
            credits_per_algo REAL NOT NULL DEFAULT 100,
            welcome_grant    REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS algochat_messages (
            id         TEXT PRIMARY KEY,
            tx_id      TEXT UNIQUE,
            sender     TEXT NOT NULL,
            recipient  TEXT NOT NULL,
            direction  TEXT NOT NULL,
            content    TEXT NOT NULL,
            round      INTEGER NOT NULL DEFAULT 0,
            amount     INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dedup_state (
            namespace  TEXT NOT NULL,
            key        TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        CREATE TABLE IF NOT EXISTS algo_spend_ledger (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            day         TEXT NOT NULL,
            fee         INTEGER NOT NULL,
            session_id  TEXT,
            participant TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_algo_spend_day ON algo_spend_ledger(day);

        CREATE TABLE IF NOT EXISTS allowlist (
            address  TEXT PRIMARY KEY,
            label    TEXT,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS webhook_registrations (
            id         TEXT PRIMARY KEY,
            url        TEXT NOT NULL,
            events     TEXT NOT NULL,
            secret     TEXT,
            active     INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id         TEXT PRIMARY KEY,
            webhook_id TEXT,
            source     TEXT NOT NULL,
            event_id   TEXT NOT NULL,
            status     TEXT NOT NULL,
            payload    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_webhook
            ON webhook_deliveries(webhook_id, created_at DESC);
        "#,
    )
}
