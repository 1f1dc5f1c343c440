use clap::{Parser, Subcommand};
use kpack::{
    CertificateImportWorkflow, Directories, FileStore, ImportWorkflow, KpackError, Result,
    SignWorkflow, SigningIdentity, SigningOptions, ZipBackend, ZsignBackend,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kpack")]
#[command(about = "iOS app archive packaging, injection and signing")]
#[command(version)]
struct Cli {
    /// Library root (where imported and signed apps are stored)
    #[arg(long, default_value = ".")]
    documents: PathBuf,

    /// ZIP extraction backend: Zip or ZIPFoundation
    #[arg(long, default_value = "Zip")]
    extraction_library: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import an .ipa/.tipa into the library
    Import {
        /// The archive to import
        input: PathBuf,
    },

    /// Modify, inject and sign an imported app directory
    Sign {
        /// The .app directory to process
        app: PathBuf,

        /// Options file (JSON); defaults are used when omitted
        #[arg(short, long)]
        options: Option<PathBuf>,

        /// Certificate (.p12)
        #[arg(long, requires = "provision")]
        p12: Option<PathBuf>,

        /// Provisioning profile
        #[arg(long, requires = "p12")]
        provision: Option<PathBuf>,

        /// Certificate password
        #[arg(long, default_value = "")]
        password: String,

        /// Tweaks/files to inject
        #[arg(short = 'f', long = "inject")]
        inject: Vec<PathBuf>,

        /// Only apply modifications, skip sealing
        #[arg(long)]
        only_modify: bool,
    },

    /// Extract an archive (.ipa/.tipa/.deb) to a directory
    Extract {
        input: PathBuf,
        destination: PathBuf,
    },

    /// Package an .app directory as an .ipa
    Package {
        app: PathBuf,
        output: PathBuf,
    },

    /// Certificate operations
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CertCommands {
    /// Import a certificate from .p12 + .mobileprovision, or a .ksign file
    Import {
        /// A .ksign container, or a .p12 when used with --provision
        input: PathBuf,

        #[arg(long)]
        provision: Option<PathBuf>,

        #[arg(long, default_value = "")]
        password: String,

        #[arg(long, default_value = "imported")]
        nickname: String,
    },

    /// Export a stored certificate as a .ksign container
    Export {
        uuid: Uuid,
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let dirs = Directories::new(&cli.documents);
    let store = Arc::new(FileStore::open(dirs.root().join("store.json"))?);
    kpack::migrate_certificates(&*store)?;
    let backend = Arc::new(ZsignBackend);
    let zip_backend = ZipBackend::from_setting(&cli.extraction_library);

    match cli.command {
        Commands::Import { input } => {
            let workflow = ImportWorkflow::new(input, dirs, store, zip_backend);
            let record = workflow.run(&mut |p| log::debug!("extracting {:.0}%", p * 100.0))?;
            println!("imported {} ({})", record.name.as_deref().unwrap_or("?"), record.uuid);
        }

        Commands::Sign {
            app,
            options,
            p12,
            provision,
            password,
            inject,
            only_modify,
        } => {
            let mut options = match options {
                Some(path) => SigningOptions::load(&path)?,
                None => SigningOptions::default(),
            };
            options.injection_files.extend(inject);
            options.only_modify = options.only_modify || only_modify;
            options.do_adhoc_signing = options.do_adhoc_signing || p12.is_none();

            let identity = match (p12, provision) {
                (Some(p12), Some(provision)) => Some(SigningIdentity {
                    p12,
                    provision,
                    password,
                }),
                _ => None,
            };

            let ellekit = dirs.tweaks().join("ellekit.deb");
            let ellekit = ellekit.exists().then_some(ellekit);

            let workflow =
                SignWorkflow::new(app, options, identity, dirs, store, backend, ellekit);
            let record = workflow.run()?;
            println!("signed {} ({})", record.name.as_deref().unwrap_or("?"), record.uuid);
        }

        Commands::Extract { input, destination } => {
            let is_deb = input.extension().map(|e| e == "deb").unwrap_or(false);
            if is_deb {
                kpack::extract_deb(&input, &destination, &mut |_| {})?;
            } else {
                kpack::extract_zip(&input, &destination, zip_backend, &mut |_| {})?;
            }
            println!("extracted to {}", destination.display());
        }

        Commands::Package { app, output } => {
            kpack::package_directory_as_ipa(&app, &output, &mut |_| {})?;
            println!("packaged {}", output.display());
        }

        Commands::Cert { command } => match command {
            CertCommands::Import {
                input,
                provision,
                password,
                nickname,
            } => {
                let workflow = CertificateImportWorkflow::new(store, backend);
                let record = match provision {
                    Some(provision) => workflow.import_files(
                        &input,
                        &provision,
                        Some(password.as_str()),
                        &nickname,
                    )?,
                    None => {
                        if input.extension().map(|e| e != "ksign").unwrap_or(true) {
                            return Err(KpackError::InvalidInput(
                                "expected a .ksign container or --provision".to_string(),
                            ));
                        }
                        workflow.import_ksign(&input)?
                    }
                };
                println!("imported certificate {} ({})", record.nickname, record.uuid);
            }

            CertCommands::Export { uuid, output } => {
                let container = kpack::export_certificate(&*store, uuid)?;
                fs::write(&output, container)?;
                println!("exported {}", output.display());
            }
        },
    }

    Ok(())
}
