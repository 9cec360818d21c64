use anyhow::{Context, Result};
use clap::Parser as _;
use emv_auth::{pki, AuthMethod, CaKeyStore, EmvPk, OfflineAuth, TlvDb, VerificationPolicy};
use owo_colors::{colors, OwoColorize};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, trace_span};

#[derive(clap::Parser, Debug)]
struct Args {
    /// Increase log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    quiet: u8,

    /// Command.
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Dump hex-encoded TLV data as a tree.
    Tlv {
        /// TLV data, in hex. Whitespace is ignored.
        data: Vec<String>,
    },

    /// List the keys in a CA key file, and whether they check out.
    Capk {
        /// CA public key file.
        path: PathBuf,
    },

    /// Recover the issuer and ICC keys from card data, and run SDA if the card uses it.
    Recover {
        /// CA public key file.
        #[arg(short, long)]
        capk: PathBuf,

        /// Carry on past hash mismatches, reporting the result as unverified.
        #[arg(long)]
        lenient: bool,

        /// Card data as hex TLVs: 84, 8F, 5A, the certificates, and the records to be
        /// authenticated as tag 21.
        data: Vec<String>,
    },
}

type TagColor = colors::Cyan;
type LenColor = colors::Yellow;
type BadColor = colors::Red;
type GoodColor = colors::Green;

impl Command {
    pub fn run(&self) -> Result<()> {
        match self {
            Self::Tlv { data } => self.tlv(data),
            Self::Capk { path } => self.capk(path),
            Self::Recover {
                capk,
                lenient,
                data,
            } => self.recover(capk, *lenient, data),
        }
    }

    fn tlv(&self, data: &[String]) -> Result<()> {
        let span = trace_span!("tlv");
        let _enter = span.enter();

        let db = parse_hex(data)?;
        db.visit(db.root(), |tlv, level, is_leaf| {
            print!(
                "{:indent$}{:X} {:02X}",
                "",
                tlv.tag.fg::<TagColor>(),
                tlv.len().fg::<LenColor>(),
                indent = level * 2
            );
            if is_leaf {
                print!(" {}", hex::encode_upper(tlv.value));
            }
            println!();
        });
        Ok(())
    }

    fn capk(&self, path: &Path) -> Result<()> {
        let span = trace_span!("capk");
        let _enter = span.enter();

        let today = chrono::Local::now().date_naive();
        let keys = CaKeyStore::load(path).with_context(|| format!("couldn't read {path:?}"))?;
        for pk in keys.iter() {
            print!(
                "{} {:02X} {:4} bits",
                hex::encode_upper(pk.rid),
                pk.index,
                pk.modulus.len() * 8
            );
            if pk.verify() {
                print!(" {}", "ok".fg::<GoodColor>());
            } else {
                print!(" {}", "bad checksum".fg::<BadColor>());
            }
            if pk.is_expired(today) {
                print!(" {}", "expired".fg::<BadColor>());
            }
            println!();
        }
        debug!(n = keys.len(), "Loaded CA keys");
        Ok(())
    }

    fn recover(&self, capk: &Path, lenient: bool, data: &[String]) -> Result<()> {
        let span = trace_span!("recover");
        let _enter = span.enter();

        let keys = CaKeyStore::load(capk).with_context(|| format!("couldn't read {capk:?}"))?;
        let policy = if lenient {
            VerificationPolicy::LENIENT
        } else {
            VerificationPolicy::STRICT
        };
        let auth = OfflineAuth::new(&keys).with_policy(policy);
        let mut db = parse_hex(data)?;

        let method = db
            .get_tlv(emv_auth::auth::TAG_AIP)
            .and_then(|aip| AuthMethod::from_aip(aip.value));
        debug!(?method, "Card's offline data authentication");
        if method == Some(AuthMethod::Sda) {
            let outcome = auth.sda(&mut db)?;
            print_key("Issuer", &outcome.issuer);
            print_verdict(outcome.is_authentic());
            return Ok(());
        }

        let ca = auth.ca_key(&db)?;
        let issuer = pki::recover_issuer_cert(ca, &db, policy)?;
        print_key("Issuer", &issuer.value);
        let sda = db
            .get_tlv(emv_auth::auth::TAG_ODA_DATA)
            .map_or(&[][..], |tlv| tlv.value);
        let icc = pki::recover_icc_cert(&issuer.value, &db, sda, policy)?;
        print_key("ICC", &icc.value);
        print_verdict(issuer.is_authentic() && icc.is_authentic());
        Ok(())
    }
}

fn parse_hex(data: &[String]) -> Result<TlvDb<'static>> {
    let text: String = data.concat().split_whitespace().collect();
    let raw = hex::decode(&text).context("invalid hex")?;
    Ok(TlvDb::parse_multi(&raw)?)
}

fn print_key(name: &str, pk: &EmvPk) {
    println!("{}", format!("┏╸{name}").italic());
    println!("┃ serial  {}", hex::encode_upper(pk.serial));
    println!("┃ expires {:06X}", pk.expire);
    println!("┃ exp     {}", hex::encode_upper(&pk.exp));
    println!("┗ modulus {}", hex::encode_upper(&pk.modulus).fg::<LenColor>());
}

fn print_verdict(authentic: bool) {
    if authentic {
        println!("{}", "VERIFIED".fg::<GoodColor>());
    } else {
        println!("{}", "NOT VERIFIED".fg::<BadColor>());
    }
}

fn init_logging(args: &Args) {
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(match (2 + args.verbose).saturating_sub(args.quiet) {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            4.. => tracing::Level::TRACE,
        })
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    trace!(?args, "Starting up");
    args.command.run()
}
