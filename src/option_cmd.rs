//! `option` commands over the persisted configuration bag.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::options::OptionsStore;
use crate::settings::{constant_names, constant_value, mask_secret, process_env, OPTION_KEYS, SECRET_KEYS};

async fn open(config: &Config) -> Result<OptionsStore> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(OptionsStore::new(pool))
}

fn display_value(key: &str, value: &str) -> String {
    if SECRET_KEYS.contains(&key) {
        mask_secret(value)
    } else {
        value.to_string()
    }
}

pub async fn run_option_set(config: &Config, key: &str, value: &str) -> Result<()> {
    let options = open(config).await?;
    options.set(key, value).await?;
    println!("{} = {}", key, display_value(key, value));
    if constant_value(key, &process_env).is_some() {
        eprintln!(
            "Warning: {} is also defined as a constant ({}); the constant takes priority.",
            key,
            constant_names(key).join(" or ")
        );
    }
    Ok(())
}

pub async fn run_option_get(config: &Config, key: &str) -> Result<()> {
    let options = open(config).await?;
    match options.get(key).await? {
        Some(value) => println!("{}", display_value(key, &value)),
        None => bail!("Option not set: {}", key),
    }
    Ok(())
}

pub async fn run_option_unset(config: &Config, key: &str) -> Result<()> {
    let options = open(config).await?;
    if options.unset(key).await? {
        println!("Removed {}", key);
    } else {
        println!("{} was not set", key);
    }
    Ok(())
}

pub async fn run_option_list(config: &Config) -> Result<()> {
    let options = open(config).await?;
    let bag = options.load_all().await?;
    for key in OPTION_KEYS {
        let stored = bag
            .get(*key)
            .map(|v| display_value(key, v))
            .unwrap_or_else(|| "-".to_string());
        let constant = if constant_value(key, &process_env).is_some() {
            "  [constant set]"
        } else {
            ""
        };
        println!("{:<20} {}{}", key, stored, constant);
    }
    Ok(())
}
