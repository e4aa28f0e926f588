/**
 * Discovery Example
 *
 * Scans the networks in MIDEA_NETWORKS (comma separated, local /24 when
 * unset) and merges the result with the cloud account when MIDEA_ACCOUNT
 * and MIDEA_PASSWORD are set.
 */
use rustmidea::{CloudConfig, CloudSession, Credentials, Manager};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- Rustmidea - Discovery ---");

    let networks: Vec<String> = env::var("MIDEA_NETWORKS")
        .map(|v| v.split(',').map(|n| n.trim().to_string()).collect())
        .unwrap_or_default();

    let cloud = match (env::var("MIDEA_ACCOUNT"), env::var("MIDEA_PASSWORD")) {
        (Ok(account), Ok(password)) => {
            match CloudSession::new(CloudConfig::default(), Credentials::new(&account, &password)) {
                Ok(cloud) => Some(Arc::new(cloud)),
                Err(e) => {
                    println!("[ERROR] Cloud setup failed: {}", e);
                    return;
                }
            }
        }
        _ => None,
    };

    let manager = Manager::new();
    match manager.find_appliances(cloud, &networks).await {
        Ok(found) => {
            for (i, appliance) in found.iter().enumerate() {
                let address = appliance
                    .discovery
                    .as_ref()
                    .map(|d| d.address.to_string())
                    .unwrap_or_else(|| "cloud only".to_string());
                println!(
                    "[{}] {} '{}' ({}) at {}",
                    i + 1,
                    appliance.id,
                    appliance.name,
                    appliance.family,
                    address
                );
            }
            println!("[INFO] Total appliances found: {}", found.len());
        }
        Err(e) => println!("[ERROR] Discovery failed: {}", e),
    }
}
