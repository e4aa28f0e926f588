/**
 * Status Example
 *
 * Reads one appliance over the LAN using MIDEA_ADDRESS, MIDEA_TOKEN and
 * MIDEA_KEY, or by id through the cloud using MIDEA_ID, MIDEA_ACCOUNT and
 * MIDEA_PASSWORD.
 */
use rustmidea::{Auth, CloudConfig, CloudSession, Credentials, Manager, Target};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- Rustmidea - Status ---");

    let (target, auth) = match from_env() {
        Some(selected) => selected,
        None => {
            println!("[ERROR] Set MIDEA_ADDRESS/MIDEA_TOKEN/MIDEA_KEY or MIDEA_ID/MIDEA_ACCOUNT/MIDEA_PASSWORD");
            return;
        }
    };

    let manager = Manager::new();
    match manager.appliance_state(&target, &auth).await {
        Ok(state) => println!("[SUCCESS] {:#?}", state),
        Err(e) => println!("[ERROR] Status failed: {}", e),
    }
}

fn from_env() -> Option<(Target, Auth)> {
    if let (Ok(address), Ok(token), Ok(key)) = (
        env::var("MIDEA_ADDRESS"),
        env::var("MIDEA_TOKEN"),
        env::var("MIDEA_KEY"),
    ) {
        return Some((
            Target::Address(address.parse().ok()?),
            Auth::Token { token, key },
        ));
    }
    let id = env::var("MIDEA_ID").ok()?.parse().ok()?;
    let account = env::var("MIDEA_ACCOUNT").ok()?;
    let password = env::var("MIDEA_PASSWORD").ok()?;
    let cloud = CloudSession::new(CloudConfig::default(), Credentials::new(&account, &password)).ok()?;
    Some((Target::Id(id), Auth::Cloud(Arc::new(cloud))))
}
