use anyhow::Result;
use std::env;

pub struct Args {
    pub config_file: String,
    pub prom_exporter: Option<String>,
}

impl Args {
    fn show_usage() {
        println!("Sava Broker Usage:");
        println!("  --config-file        Path to config file (required)");
        println!("  --prom-exporter      Prometheus Exporter http address");
    }

    pub fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().collect();

        if args.len() <= 1 {
            Self::show_usage();
            return Err(anyhow::anyhow!("No arguments provided"));
        }

        let mut config_file = None;
        let mut prom_exporter = None;

        let mut args_iter = args.iter().skip(1);
        while let Some(arg) = args_iter.next() {
            match arg.as_str() {
                "--config-file" => {
                    config_file = args_iter.next().map(|s| s.to_string());
                }
                "--prom-exporter" => {
                    prom_exporter = args_iter.next().map(|s| s.to_string());
                }
                _ => return Err(anyhow::anyhow!("Unknown argument: {}", arg)),
            }
        }

        Ok(Args {
            config_file: config_file
                .ok_or_else(|| anyhow::anyhow!("Missing required --config-file"))?,
            prom_exporter,
        })
    }
}
