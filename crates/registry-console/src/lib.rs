//! Line-oriented operator REPL. Reads commands from stdin through
//! `rustyline`, dispatches on the first token, and prints ASCII tables.

use std::sync::Arc;

use registry_bus::MessageBus;
use registry_bus::MessageEnvelope;
use registry_bus::channels;
use registry_catalog::SlotCatalog;
use registry_core::FamilyId;
use registry_core::NodeIdentifier;
use registry_core::VariantId;
use registry_membership::BackendRegistry;
use registry_membership::ProxyRegistry;
use registry_provisioning::ProvisionRequest;
use registry_provisioning::ProvisionResult;
use registry_provisioning::ProvisioningService;
use registry_routing::LocateService;
use registry_shutdown::ShutdownManager;
use rustyline::DefaultEditor;

pub struct Console {
    bus: Arc<MessageBus>,
    proxies: Arc<ProxyRegistry>,
    backends: Arc<BackendRegistry>,
    catalog: Arc<SlotCatalog>,
    locate: Arc<LocateService>,
    provisioning: Arc<ProvisioningService>,
    shutdown: Arc<ShutdownManager>,
}

/// Signals the loop exited via the `stop` command rather than EOF/error.
pub enum ConsoleExit {
    OperatorStop,
    Eof,
}

impl Console {
    pub fn new(
        bus: Arc<MessageBus>,
        proxies: Arc<ProxyRegistry>,
        backends: Arc<BackendRegistry>,
        catalog: Arc<SlotCatalog>,
        locate: Arc<LocateService>,
        provisioning: Arc<ProvisioningService>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self { bus, proxies, backends, catalog, locate, provisioning, shutdown }
    }

    pub async fn run(&self) -> ConsoleExit {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                log::error!("console disabled: failed to start line editor: {e}");
                return ConsoleExit::Eof;
            }
        };

        loop {
            match editor.readline("registry> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line);
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    if let Some(&"stop") = tokens.first() {
                        return ConsoleExit::OperatorStop;
                    }
                    self.dispatch(&tokens).await;
                }
                Err(_) => return ConsoleExit::Eof,
            }
        }
    }

    async fn dispatch(&self, tokens: &[&str]) {
        let result = match tokens {
            ["help"] => Ok(self.help()),
            ["status"] => Ok(self.status().await),
            ["clear"] => {
                print!("\x1B[2J\x1B[1;1H");
                Ok(())
            }
            ["debug"] => {
                let new_level = if log::max_level() == log::LevelFilter::Debug {
                    log::LevelFilter::Info
                } else {
                    log::LevelFilter::Debug
                };
                log::set_max_level(new_level);
                println!("log level is now {new_level}");
                Ok(())
            }
            ["reload"] => {
                println!("configuration reload is not supported while running; restart to pick up changes");
                Ok(())
            }
            ["reregister"] => self.reregister().await,
            ["proxyregistry"] => Ok(self.print_proxy_table().await),
            ["backendregistry"] => Ok(self.print_backend_table().await),
            ["ls"] => Ok(self.print_slot_table(0).await),
            ["ls", page] => match page.parse::<usize>() {
                Ok(page) => Ok(self.print_slot_table(page).await),
                Err(_) => Err(format!("'{page}' is not a page number")),
            },
            ["locateplayer", who] => Ok(self.locate_player(who).await),
            ["provisionslot", rest @ ..] => self.provision(rest, 1).await,
            ["provisionminigame", rest @ ..] => self.provision(rest, 4).await,
            ["shutdown", rest @ ..] => self.shutdown(rest).await,
            [] => Ok(()),
            _ => Err(format!("unknown command: {}", tokens.join(" "))),
        };

        if let Err(message) = result {
            println!("error: {message} (type 'help' for the command list)");
        }
    }

    fn help(&self) {
        println!("commands:");
        println!("  help");
        println!("  stop");
        println!("  status");
        println!("  clear");
        println!("  debug");
        println!("  reload");
        println!("  reregister");
        println!("  proxyregistry");
        println!("  backendregistry");
        println!("  ls [page]");
        println!("  locateplayer <uuid|name>");
        println!("  provisionslot <family> [variant] [count]");
        println!("  provisionminigame <family> [variant] [count]");
        println!("  shutdown {{all|family <env>|service <id>|cancel <intentId>}} <seconds> [--reason ...] [--force]");
    }

    async fn status(&self) {
        let proxies = self.proxies.list().await;
        let backends = self.backends.list().await;
        println!("proxies:  {}", proxies.len());
        println!("backends: {}", backends.len());
        println!("bus:      {}", if self.bus.is_healthy().await { "healthy" } else { "degraded" });
    }

    async fn reregister(&self) -> Result<(), String> {
        self.bus
            .broadcast(channels::REREGISTRATION_REQUEST, MessageEnvelope::new("ReregistrationRequest", serde_json::json!({})))
            .await
            .map_err(|e| e.to_string())
    }

    async fn print_proxy_table(&self) {
        let rows = self.proxies.list().await;
        println!("{:<42} {:<16} {:<6} {:<12}", "ID", "ADDRESS", "PORT", "STATUS");
        for row in rows {
            println!("{:<42} {:<16} {:<6} {:<12?}", row.id.to_string(), row.address, row.port, row.status);
        }
    }

    async fn print_backend_table(&self) {
        let rows = self.backends.list().await;
        println!("{:<42} {:<10} {:<16} {:<6} {:<8} {:<12}", "ID", "ROLE", "ADDRESS", "PORT", "PLAYERS", "STATUS");
        for row in rows {
            println!(
                "{:<42} {:<10} {:<16} {:<6} {:<8} {:<12?}",
                row.id.to_string(),
                row.role,
                row.address,
                row.port,
                row.player_count,
                row.status
            );
        }
    }

    async fn print_slot_table(&self, page: usize) {
        const PAGE_SIZE: usize = 20;
        let backends = self.backends.list().await;
        let mut rows: Vec<(NodeIdentifier, registry_core::LogicalSlotRecord)> = Vec::new();
        for backend in &backends {
            for slot in backend.slots.values() {
                rows.push((backend.id, slot.clone()));
            }
        }
        println!("{:<42} {:<16} {:<16} {:<12}", "BACKEND", "SLOT", "FAMILY", "STATUS");
        for (backend_id, slot) in rows.iter().skip(page * PAGE_SIZE).take(PAGE_SIZE) {
            println!("{:<42} {:<16} {:<16} {:<12?}", backend_id.to_string(), slot.slot_id.as_str(), slot.family_id.as_str(), slot.status);
        }
        let pages = rows.len().div_ceil(PAGE_SIZE).max(1);
        println!("page {}/{}", page + 1, pages);
    }

    async fn locate_player(&self, who: &str) {
        let result = self.locate.locate(who).await;
        if result.found {
            println!(
                "found: server={} family={} slotSuffix={}",
                result.server_id.unwrap_or_default(),
                result.family_id.map(|f| f.to_string()).unwrap_or_default(),
                result.slot_suffix.unwrap_or_default(),
            );
        } else {
            println!("not found: {who}");
        }
    }

    async fn provision(&self, args: &[&str], default_count: u32) -> Result<(), String> {
        let family = args.first().ok_or("usage: provisionslot <family> [variant] [count]")?;
        let variant = args.get(1).filter(|v| v.parse::<u32>().is_err()).map(|v| VariantId::new(*v));
        let count = args
            .iter()
            .skip(1)
            .find_map(|a| a.parse::<u32>().ok())
            .unwrap_or(default_count);

        let result = self
            .provisioning
            .provision(ProvisionRequest {
                family_id: FamilyId::new(*family),
                variant_id: variant,
                desired_count: count,
                affinity_hint: None,
                requester_id: "console".into(),
            })
            .await;

        match result {
            ProvisionResult::Full { token, slots } => {
                println!("provisioned {} slot(s), token={token}", slots.len());
                for slot in slots {
                    println!("  {} on {}", slot.slot_id, slot.backend_id);
                }
                Ok(())
            }
            ProvisionResult::Partial { token, slots, reason } => {
                println!("partial provision ({reason}), token={token}");
                for slot in slots {
                    println!("  {} on {}", slot.slot_id, slot.backend_id);
                }
                Ok(())
            }
            ProvisionResult::Exhausted => Err(format!("no available slots for family {family}")),
        }
    }

    async fn shutdown(&self, args: &[&str]) -> Result<(), String> {
        let (subcommand, rest) = args.split_first().ok_or("usage: shutdown {all|family <env>|service <id>|cancel <intentId>} <seconds>")?;

        if *subcommand == "cancel" {
            let intent_id = rest.first().ok_or("usage: shutdown cancel <intentId>")?;
            return self.shutdown.cancel_intent(intent_id, "console").await.map_err(|e| e.to_string());
        }

        let (target_arg, rest) = match *subcommand {
            "all" => (None, rest),
            "family" | "service" => {
                let (value, rest) = rest.split_first().ok_or(format!("usage: shutdown {subcommand} <value> <seconds>"))?;
                (Some(*value), rest)
            }
            other => return Err(format!("unknown shutdown target '{other}'")),
        };

        let seconds: u64 = rest.first().ok_or("missing countdown seconds")?.parse().map_err(|_| "countdown seconds must be a number".to_owned())?;
        let force = rest.iter().any(|a| *a == "--force");
        let reason = rest
            .iter()
            .position(|a| *a == "--reason")
            .and_then(|i| rest.get(i + 1..))
            .map(|words| words.iter().take_while(|w| !w.starts_with("--")).copied().collect::<Vec<_>>().join(" "))
            .unwrap_or_else(|| "operator requested".to_owned());

        let targets = self.resolve_targets(*subcommand, target_arg).await?;
        if targets.is_empty() {
            return Err("no matching targets".to_owned());
        }
        let intent_id = self.shutdown.create_intent(targets, seconds, reason, force).await;
        println!("shutdown intent {intent_id} scheduled");
        Ok(())
    }

    async fn resolve_targets(&self, subcommand: &str, value: Option<&str>) -> Result<Vec<NodeIdentifier>, String> {
        match subcommand {
            "all" => {
                let mut ids: Vec<NodeIdentifier> = self.proxies.list().await.into_iter().map(|r| r.id).collect();
                ids.extend(self.backends.list().await.into_iter().map(|r| r.id));
                Ok(ids)
            }
            "family" => {
                let family = FamilyId::new(value.ok_or("missing family name")?);
                Ok(self
                    .catalog
                    .per_server_capacities()
                    .await
                    .into_iter()
                    .filter(|(_, capacities)| capacities.contains_key(&family))
                    .map(|(id, _)| id)
                    .collect())
            }
            "service" => {
                let id = NodeIdentifier::parse(value.ok_or("missing service id")?).map_err(|e| e.to_string())?;
                Ok(vec![id])
            }
            other => Err(format!("unknown shutdown target '{other}'")),
        }
    }
}
