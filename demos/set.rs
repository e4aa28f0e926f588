/**
 * Set Example
 *
 * Applies MIDEA_SET (for example "target_humidity=50,fan_speed=60") to an
 * appliance at MIDEA_ADDRESS using MIDEA_TOKEN and MIDEA_KEY.
 */
use rustmidea::{Auth, Manager, Target};
use std::env;

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- Rustmidea - Set ---");

    let (Ok(address), Ok(token), Ok(key), Ok(changes)) = (
        env::var("MIDEA_ADDRESS"),
        env::var("MIDEA_TOKEN"),
        env::var("MIDEA_KEY"),
        env::var("MIDEA_SET"),
    ) else {
        println!("[ERROR] Set MIDEA_ADDRESS, MIDEA_TOKEN, MIDEA_KEY and MIDEA_SET");
        return;
    };
    let Ok(address) = address.parse() else {
        println!("[ERROR] Invalid address '{}'", address);
        return;
    };

    let pairs: Vec<(&str, &str)> = changes
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    println!("[INFO] Applying {:?}", pairs);

    let manager = Manager::new();
    let auth = Auth::Token { token, key };
    match manager
        .set_appliance_state(&Target::Address(address), &auth, &pairs)
        .await
    {
        Ok(state) => println!("[SUCCESS] New state: {:#?}", state),
        Err(e) => println!("[ERROR] Set failed: {}", e),
    }
}
