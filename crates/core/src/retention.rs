//! Remote retention enforcement and usage accounting (spec §4.5).

use crate::transport::SftpTransport;

/// Delete the oldest run directories beyond `keep_last`, returning the
/// names removed. Run directories sort lexically by name ascending
/// because each starts with a `YYYYMMDD-HHMMSS` timestamp.
pub async fn enforce(transport: &SftpTransport, runs_path: &str, keep_last: u32) -> Vec<String> {
    let mut names = match transport.list_run_dirs(runs_path).await {
        Ok(names) => names,
        Err(_) => return Vec::new(),
    };
    names.sort();

    let keep_last = keep_last as usize;
    if names.len() <= keep_last {
        return Vec::new();
    }

    let to_delete: Vec<String> = names[..names.len() - keep_last].to_vec();
    for name in &to_delete {
        transport.remove_run_dir(&format!("{runs_path}/{name}")).await;
    }
    to_delete
}

/// Sum file sizes recursively under the customer's base path.
pub async fn usage_bytes(transport: &SftpTransport, customer_base_path: &str) -> u64 {
    transport.usage_bytes(customer_base_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemorySftpAdapter;
    use std::sync::Arc;

    async fn seeded_transport(run_names: &[&str]) -> SftpTransport {
        let mut transport = SftpTransport::new(Arc::new(InMemorySftpAdapter::new()), 0, false, None);
        transport.connect();
        for name in run_names {
            transport
                .send(&format!("runs/{name}"), "a.txt", b"data")
                .await
                .unwrap();
        }
        transport
    }

    #[tokio::test]
    async fn s5_retention_deletes_exactly_the_oldest_excess() {
        let names = ["r1", "r2", "r3", "r4", "r5"];
        let transport = seeded_transport(&names).await;

        let deleted = enforce(&transport, "runs", 2).await;
        assert_eq!(deleted, vec!["r1", "r2", "r3"]);

        let remaining = transport.list_run_dirs("runs").await.unwrap();
        assert_eq!(remaining, vec!["r4", "r5"]);
    }

    #[tokio::test]
    async fn keep_last_at_or_above_count_deletes_nothing() {
        let names = ["r1", "r2"];
        let transport = seeded_transport(&names).await;

        let deleted = enforce(&transport, "runs", 5).await;
        assert!(deleted.is_empty());
    }

    #[tokio::test]
    async fn usage_sums_across_runs() {
        let names = ["r1", "r2"];
        let transport = seeded_transport(&names).await;

        let usage = usage_bytes(&transport, "runs").await;
        assert_eq!(usage, 8);
    }
}
