//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the pollers' writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds, capability sets and device
//! lists as JSON text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{HardwareSnapshot, StatsHistoryRow, StatsPatch, StatsSnapshot};
use crate::node::{
    Capabilities, ContainerRecord, GuestRecord, GuestStatus, GuestType, NewNode, Node, NodeId,
};

const NODE_COLUMNS: &str = "id, name, host, ssh_port, ssh_user, identity_file, \
    monitoring_enabled, monitoring_interval, auto_discovery, parent_id, guest_vmid, \
    guest_type, guest_ip, online, last_error, last_seen, capabilities";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    ///
    /// ```no_run
    /// # use homelab_monitoring::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./homelab.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn opt_millis(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
        row.get::<Option<i64>, _>(column)
            .map(Self::millis_to_timestamp)
    }

    fn opt_u64(row: &SqliteRow, column: &str) -> Option<u64> {
        row.get::<Option<i64>, _>(column).map(|v| v.max(0) as u64)
    }

    fn opt_u32(row: &SqliteRow, column: &str) -> Option<u32> {
        row.get::<Option<i64>, _>(column)
            .and_then(|v| u32::try_from(v).ok())
    }

    fn row_to_node(row: &SqliteRow) -> StorageResult<Node> {
        let capabilities: String = row.get("capabilities");
        let capabilities: Capabilities = serde_json::from_str(&capabilities)?;

        let guest_type = row
            .get::<Option<String>, _>("guest_type")
            .map(|t| t.parse::<GuestType>())
            .transpose()
            .map_err(StorageError::SerializationError)?;

        Ok(Node {
            id: row.get("id"),
            name: row.get("name"),
            host: row.get("host"),
            ssh_port: row.get::<i64, _>("ssh_port") as u16,
            ssh_user: row.get("ssh_user"),
            identity_file: row.get::<Option<String>, _>("identity_file").map(PathBuf::from),
            monitoring_enabled: row.get("monitoring_enabled"),
            monitoring_interval: row.get::<i64, _>("monitoring_interval").max(0) as u64,
            auto_discovery: row.get("auto_discovery"),
            parent_id: row.get("parent_id"),
            guest_vmid: Self::opt_u32(row, "guest_vmid"),
            guest_type,
            guest_ip: row.get("guest_ip"),
            online: row.get("online"),
            last_error: row.get("last_error"),
            last_seen: Self::opt_millis(row, "last_seen"),
            capabilities,
        })
    }

    fn row_to_stats(row: &SqliteRow) -> StatsSnapshot {
        StatsSnapshot {
            node_id: row.get("node_id"),
            cpu_percent: row.get("cpu_percent"),
            load_1m: row.get("load_1m"),
            load_5m: row.get("load_5m"),
            load_15m: row.get("load_15m"),
            ram_used_bytes: Self::opt_u64(row, "ram_used_bytes"),
            ram_available_bytes: Self::opt_u64(row, "ram_available_bytes"),
            ram_percent: row.get("ram_percent"),
            swap_used_bytes: Self::opt_u64(row, "swap_used_bytes"),
            uptime_seconds: Self::opt_u64(row, "uptime_seconds"),
            users: Self::opt_u32(row, "users"),
            containers_running: Self::opt_u32(row, "containers_running"),
            tier1_updated_at: Self::opt_millis(row, "tier1_updated_at"),
            disk_used_bytes: Self::opt_u64(row, "disk_used_bytes"),
            disk_available_bytes: Self::opt_u64(row, "disk_available_bytes"),
            disk_percent: row.get("disk_percent"),
            temp_cpu: row.get("temp_cpu"),
            temp_gpu: row.get("temp_gpu"),
            zfs_unhealthy_pools: Self::opt_u32(row, "zfs_unhealthy_pools"),
            net_rx_bytes: Self::opt_u64(row, "net_rx_bytes"),
            net_tx_bytes: Self::opt_u64(row, "net_tx_bytes"),
            tier2_updated_at: Self::opt_millis(row, "tier2_updated_at"),
            updated_at: Self::opt_millis(row, "updated_at"),
        }
    }

    async fn fetch_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn require_node(&self, id: NodeId) -> StorageResult<Node> {
        self.fetch_node(id)
            .await?
            .ok_or_else(|| StorageError::NodeNotFound(id))
    }

    async fn insert_node(&self, node: &NewNode) -> StorageResult<NodeId> {
        let capabilities = serde_json::to_string(&node.capabilities)?;

        let result = sqlx::query(
            r#"
            INSERT INTO nodes (
                name, host, ssh_port, ssh_user, identity_file, monitoring_enabled,
                monitoring_interval, auto_discovery, parent_id, guest_vmid, guest_type,
                capabilities
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.name)
        .bind(&node.host)
        .bind(node.ssh_port as i64)
        .bind(&node.ssh_user)
        .bind(node.identity_file.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(node.monitoring_enabled)
        .bind(node.monitoring_interval as i64)
        .bind(node.auto_discovery)
        .bind(node.parent_id)
        .bind(node.guest_vmid.map(i64::from))
        .bind(node.guest_type.map(|t| t.as_str()))
        .bind(capabilities)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    fn expect_affected(result: sqlx::sqlite::SqliteQueryResult, id: NodeId) -> StorageResult<()> {
        if result.rows_affected() == 0 {
            return Err(StorageError::NodeNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn list_nodes(&self) -> StorageResult<Vec<Node>> {
        let rows = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn get_node(&self, id: NodeId) -> StorageResult<Option<Node>> {
        self.fetch_node(id).await
    }

    #[instrument(skip(self, node), fields(name = %node.name))]
    async fn upsert_node(&self, node: NewNode) -> StorageResult<Node> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE name = ? LIMIT 1")
            .bind(&node.name)
            .fetch_optional(&self.pool)
            .await?;

        let id = match existing {
            Some(id) => {
                let capabilities = serde_json::to_string(&node.capabilities)?;
                sqlx::query(
                    r#"
                    UPDATE nodes SET
                        host = ?, ssh_port = ?, ssh_user = ?, identity_file = ?,
                        monitoring_enabled = ?, monitoring_interval = ?, auto_discovery = ?,
                        parent_id = ?, guest_vmid = ?, guest_type = ?, capabilities = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&node.host)
                .bind(node.ssh_port as i64)
                .bind(&node.ssh_user)
                .bind(node.identity_file.as_ref().map(|p| p.to_string_lossy().to_string()))
                .bind(node.monitoring_enabled)
                .bind(node.monitoring_interval as i64)
                .bind(node.auto_discovery)
                .bind(node.parent_id)
                .bind(node.guest_vmid.map(i64::from))
                .bind(node.guest_type.map(|t| t.as_str()))
                .bind(capabilities)
                .bind(id)
                .execute(&self.pool)
                .await?;
                id
            }
            None => self.insert_node(&node).await?,
        };

        self.require_node(id).await
    }

    async fn create_child_node(&self, node: NewNode) -> StorageResult<Node> {
        if let Some(parent) = node.parent_id {
            self.require_node(parent).await?;
            if let (Some(guest_type), Some(vmid)) = (node.guest_type, node.guest_vmid) {
                // idx_nodes_guest would reject it too, but without naming the guest
                if self.find_child_by_guest(parent, vmid, guest_type).await?.is_some() {
                    return Err(StorageError::DuplicateGuest {
                        parent_id: parent,
                        guest_type,
                        vmid,
                    });
                }
            }
        }
        let id = self.insert_node(&node).await?;
        debug!(node_id = id, name = %node.name, "created child node");
        self.require_node(id).await
    }

    async fn rename_node(&self, id: NodeId, name: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE nodes SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::expect_affected(result, id)
    }

    async fn set_online(&self, id: NodeId, online: bool, error: Option<&str>) -> StorageResult<()> {
        let result = if online {
            sqlx::query("UPDATE nodes SET online = 1, last_error = NULL, last_seen = ? WHERE id = ?")
                .bind(Self::timestamp_to_millis(&Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                "UPDATE nodes SET online = 0, last_error = COALESCE(?, last_error) WHERE id = ?",
            )
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?
        };
        Self::expect_affected(result, id)
    }

    async fn set_guest_ip(&self, id: NodeId, ip: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE nodes SET guest_ip = ? WHERE id = ?")
            .bind(ip)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::expect_affected(result, id)
    }

    async fn list_children(&self, parent_id: NodeId) -> StorageResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ? ORDER BY id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn find_child_by_guest(
        &self,
        parent_id: NodeId,
        vmid: u32,
        guest_type: GuestType,
    ) -> StorageResult<Option<Node>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id = ? AND guest_vmid = ? AND guest_type = ?"
        ))
        .bind(parent_id)
        .bind(i64::from(vmid))
        .bind(guest_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn children_missing_ip(&self) -> StorageResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE guest_type IS NOT NULL AND online = 1 AND guest_ip IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn set_hypervisor(&self, id: NodeId, is_hypervisor: bool) -> StorageResult<()> {
        let result = sqlx::query("UPDATE nodes SET is_hypervisor = ? WHERE id = ?")
            .bind(is_hypervisor)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::expect_affected(result, id)
    }

    async fn is_hypervisor(&self, id: NodeId) -> StorageResult<bool> {
        let flag: Option<bool> = sqlx::query_scalar("SELECT is_hypervisor FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn current_stats(&self, id: NodeId) -> StorageResult<Option<StatsSnapshot>> {
        let row = sqlx::query("SELECT * FROM current_stats WHERE node_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_stats))
    }

    #[instrument(skip(self, patch))]
    async fn merge_current_stats(
        &self,
        id: NodeId,
        patch: &StatsPatch,
    ) -> StorageResult<StatsSnapshot> {
        let millis = |t: &Option<DateTime<Utc>>| t.as_ref().map(Self::timestamp_to_millis);
        let int = |v: Option<u64>| v.map(|v| v.min(i64::MAX as u64) as i64);

        // COALESCE keeps the stored value for every column the patch leaves unset
        let row = sqlx::query(
            r#"
            INSERT INTO current_stats (
                node_id, cpu_percent, load_1m, load_5m, load_15m, ram_used_bytes,
                ram_available_bytes, ram_percent, swap_used_bytes, uptime_seconds, users,
                containers_running, tier1_updated_at, disk_used_bytes, disk_available_bytes,
                disk_percent, temp_cpu, temp_gpu, zfs_unhealthy_pools, net_rx_bytes,
                net_tx_bytes, tier2_updated_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET
                cpu_percent = COALESCE(excluded.cpu_percent, current_stats.cpu_percent),
                load_1m = COALESCE(excluded.load_1m, current_stats.load_1m),
                load_5m = COALESCE(excluded.load_5m, current_stats.load_5m),
                load_15m = COALESCE(excluded.load_15m, current_stats.load_15m),
                ram_used_bytes = COALESCE(excluded.ram_used_bytes, current_stats.ram_used_bytes),
                ram_available_bytes = COALESCE(excluded.ram_available_bytes, current_stats.ram_available_bytes),
                ram_percent = COALESCE(excluded.ram_percent, current_stats.ram_percent),
                swap_used_bytes = COALESCE(excluded.swap_used_bytes, current_stats.swap_used_bytes),
                uptime_seconds = COALESCE(excluded.uptime_seconds, current_stats.uptime_seconds),
                users = COALESCE(excluded.users, current_stats.users),
                containers_running = COALESCE(excluded.containers_running, current_stats.containers_running),
                tier1_updated_at = COALESCE(excluded.tier1_updated_at, current_stats.tier1_updated_at),
                disk_used_bytes = COALESCE(excluded.disk_used_bytes, current_stats.disk_used_bytes),
                disk_available_bytes = COALESCE(excluded.disk_available_bytes, current_stats.disk_available_bytes),
                disk_percent = COALESCE(excluded.disk_percent, current_stats.disk_percent),
                temp_cpu = COALESCE(excluded.temp_cpu, current_stats.temp_cpu),
                temp_gpu = COALESCE(excluded.temp_gpu, current_stats.temp_gpu),
                zfs_unhealthy_pools = COALESCE(excluded.zfs_unhealthy_pools, current_stats.zfs_unhealthy_pools),
                net_rx_bytes = COALESCE(excluded.net_rx_bytes, current_stats.net_rx_bytes),
                net_tx_bytes = COALESCE(excluded.net_tx_bytes, current_stats.net_tx_bytes),
                tier2_updated_at = COALESCE(excluded.tier2_updated_at, current_stats.tier2_updated_at),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.cpu_percent)
        .bind(patch.load_1m)
        .bind(patch.load_5m)
        .bind(patch.load_15m)
        .bind(int(patch.ram_used_bytes))
        .bind(int(patch.ram_available_bytes))
        .bind(patch.ram_percent)
        .bind(int(patch.swap_used_bytes))
        .bind(int(patch.uptime_seconds))
        .bind(patch.users.map(i64::from))
        .bind(patch.containers_running.map(i64::from))
        .bind(millis(&patch.tier1_updated_at))
        .bind(int(patch.disk_used_bytes))
        .bind(int(patch.disk_available_bytes))
        .bind(patch.disk_percent)
        .bind(patch.temp_cpu)
        .bind(patch.temp_gpu)
        .bind(patch.zfs_unhealthy_pools.map(i64::from))
        .bind(int(patch.net_rx_bytes))
        .bind(int(patch.net_tx_bytes))
        .bind(millis(&patch.tier2_updated_at))
        .bind(Self::timestamp_to_millis(&Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        Ok(Self::row_to_stats(&row))
    }

    async fn append_stats_history(&self, row: StatsHistoryRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stats_history (
                node_id, timestamp, cpu_percent, load_1m, ram_percent, ram_used_bytes,
                disk_percent, temp_cpu, net_rx_bytes, net_tx_bytes
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.node_id)
        .bind(Self::timestamp_to_millis(&row.timestamp))
        .bind(row.cpu_percent)
        .bind(row.load_1m)
        .bind(row.ram_percent)
        .bind(row.ram_used_bytes.map(|v| v as i64))
        .bind(row.disk_percent)
        .bind(row.temp_cpu)
        .bind(row.net_rx_bytes.map(|v| v as i64))
        .bind(row.net_tx_bytes.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats_history(&self, id: NodeId, limit: usize) -> StorageResult<Vec<StatsHistoryRow>> {
        let rows = sqlx::query(
            "SELECT * FROM stats_history WHERE node_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StatsHistoryRow {
                node_id: row.get("node_id"),
                timestamp: Self::millis_to_timestamp(row.get("timestamp")),
                cpu_percent: row.get("cpu_percent"),
                load_1m: row.get("load_1m"),
                ram_percent: row.get("ram_percent"),
                ram_used_bytes: Self::opt_u64(row, "ram_used_bytes"),
                disk_percent: row.get("disk_percent"),
                temp_cpu: row.get("temp_cpu"),
                net_rx_bytes: Self::opt_u64(row, "net_rx_bytes"),
                net_tx_bytes: Self::opt_u64(row, "net_tx_bytes"),
            })
            .collect())
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_history(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM stats_history WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} history rows", deleted);
        Ok(deleted)
    }

    async fn save_hardware(&self, hw: HardwareSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hardware (
                node_id, cpu_model, cpu_cores, ram_total_bytes, pci_devices, usb_devices,
                smart_healthy, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (node_id) DO UPDATE SET
                cpu_model = excluded.cpu_model,
                cpu_cores = excluded.cpu_cores,
                ram_total_bytes = excluded.ram_total_bytes,
                pci_devices = excluded.pci_devices,
                usb_devices = excluded.usb_devices,
                smart_healthy = excluded.smart_healthy,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(hw.node_id)
        .bind(&hw.cpu_model)
        .bind(hw.cpu_cores.map(i64::from))
        .bind(hw.ram_total_bytes.map(|v| v as i64))
        .bind(serde_json::to_string(&hw.pci_devices)?)
        .bind(serde_json::to_string(&hw.usb_devices)?)
        .bind(hw.smart_healthy)
        .bind(Self::timestamp_to_millis(&hw.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hardware(&self, id: NodeId) -> StorageResult<Option<HardwareSnapshot>> {
        let Some(row) = sqlx::query("SELECT * FROM hardware WHERE node_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let pci: String = row.get("pci_devices");
        let usb: String = row.get("usb_devices");

        Ok(Some(HardwareSnapshot {
            node_id: row.get("node_id"),
            cpu_model: row.get("cpu_model"),
            cpu_cores: Self::opt_u32(&row, "cpu_cores"),
            ram_total_bytes: Self::opt_u64(&row, "ram_total_bytes"),
            pci_devices: serde_json::from_str(&pci)?,
            usb_devices: serde_json::from_str(&usb)?,
            smart_healthy: row.get("smart_healthy"),
            updated_at: Self::millis_to_timestamp(row.get("updated_at")),
        }))
    }

    #[instrument(skip(self, guests), fields(count = guests.len()))]
    async fn replace_guests(&self, host_id: NodeId, guests: Vec<GuestRecord>) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM guests WHERE host_id = ?")
            .bind(host_id)
            .execute(&mut *tx)
            .await?;

        for guest in &guests {
            sqlx::query(
                "INSERT OR REPLACE INTO guests (host_id, vmid, guest_type, name, status) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(host_id)
            .bind(i64::from(guest.vmid))
            .bind(guest.guest_type.as_str())
            .bind(&guest.name)
            .bind(guest.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_guests(&self, host_id: NodeId) -> StorageResult<Vec<GuestRecord>> {
        let rows = sqlx::query(
            "SELECT vmid, guest_type, name, status FROM guests WHERE host_id = ? ORDER BY guest_type, vmid",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        let mut guests = Vec::with_capacity(rows.len());
        for row in &rows {
            let guest_type: String = row.get("guest_type");
            let Ok(guest_type) = guest_type.parse::<GuestType>() else {
                warn!(host_id, "skipping guest with unknown type {guest_type}");
                continue;
            };
            let status: String = row.get("status");
            guests.push(GuestRecord {
                vmid: row.get::<i64, _>("vmid") as u32,
                name: row.get("name"),
                status: GuestStatus::from(status.as_str()),
                guest_type,
            });
        }
        Ok(guests)
    }

    async fn replace_containers(
        &self,
        node_id: NodeId,
        containers: Vec<ContainerRecord>,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM containers WHERE node_id = ?")
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        for c in &containers {
            sqlx::query(
                "INSERT OR REPLACE INTO containers (node_id, container_id, name, image, status, state) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(node_id)
            .bind(&c.container_id)
            .bind(&c.name)
            .bind(&c.image)
            .bind(&c.status)
            .bind(&c.state)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_containers(&self, node_id: NodeId) -> StorageResult<Vec<ContainerRecord>> {
        let rows = sqlx::query(
            "SELECT container_id, name, image, status, state FROM containers WHERE node_id = ? ORDER BY name",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ContainerRecord {
                container_id: row.get("container_id"),
                name: row.get("name"),
                image: row.get("image"),
                status: row.get("status"),
                state: row.get("state"),
            })
            .collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let result: Result<i64, sqlx::Error> = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(count) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("path".to_string(), self.db_path.clone()),
                    ("nodes".to_string(), count.to_string()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check query failed: {e}"),
                    metadata: HashMap::from([("backend".to_string(), "sqlite".to_string())]),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
