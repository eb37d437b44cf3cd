use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use osm_boundary_import::countries::{self, OsmApiClient};
use osm_boundary_import::import::{self, ImportMode};
use osm_boundary_import::{db, init_logging, language};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    args.command.run()
}

/// Imports OSM administrative boundaries from KML exports into a
/// generational boundary database.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Increase diagnostic output (repeat for more).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema and seed reference rows.
    Init {
        /// Boundary database file.
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
    },
    /// Create a new inactive generation to import into.
    NewGeneration {
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
    },
    /// Mark a generation as active, making it visible to readers.
    ActivateGeneration {
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        #[arg(long, value_name = "ID")]
        generation: i64,
    },
    /// Import OSM boundary data from a directory tree of KML files.
    Import {
        /// Directory containing per-type subdirectories (e.g. O02, O04) of KML files.
        kml_directory: PathBuf,
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        /// Actually update the database; without it this is a dry run.
        #[arg(long)]
        commit: bool,
        /// Import to a new inactive generation, and update boundaries of any matching areas.
        #[arg(long, conflicts_with = "alter_current_generation")]
        new_generation_update_boundaries: bool,
        /// Rather than importing to a new inactive generation, update the current, active generation.
        #[arg(long)]
        alter_current_generation: bool,
    },
    /// Fetch ISO country codes for country areas and spatially assign
    /// every area in a generation to its enclosing countries.
    UpdateCountries {
        #[arg(long, value_name = "FILE")]
        db: PathBuf,
        #[arg(long, value_name = "ID")]
        generation: i64,
        /// Actually update the database; without it the whole pass is rolled back.
        #[arg(long)]
        commit: bool,
    },
}

impl Command {
    fn run(self) -> Result<()> {
        match self {
            Command::Init { db } => {
                let conn = db::open(&db)?;
                db::init_schema(&conn)?;
                db::seed_reference_data(&conn)?;
                println!("Initialized boundary database {}", db.display());
                Ok(())
            }
            Command::NewGeneration { db } => {
                let conn = db::open(&db)?;
                let generation = db::create_generation(&conn)?;
                println!("Created new inactive generation {}", generation.id);
                Ok(())
            }
            Command::ActivateGeneration { db, generation } => {
                let conn = db::open(&db)?;
                let generation = db::activate_generation(&conn, generation)?;
                println!("Activated generation {}", generation.id);
                Ok(())
            }
            Command::Import {
                kml_directory,
                db,
                commit,
                new_generation_update_boundaries,
                alter_current_generation,
            } => {
                let conn = db::open(&db)?;
                let mode = if alter_current_generation {
                    ImportMode::AlterActiveGeneration
                } else if new_generation_update_boundaries {
                    ImportMode::NewGenerationForceReuse
                } else {
                    ImportMode::NewGenerationCompareBoundaries
                };
                log::info!("Finding language codes...");
                let table = language::fetch_language_table(language::ISO_639_2_URL)?;
                let languages = language::language_lookup(&table);
                import::import_directory(&conn, &kml_directory, mode, commit, &languages)
            }
            Command::UpdateCountries { db, generation, commit } => {
                let mut conn = db::open(&db)?;
                countries::update_countries(&mut conn, &OsmApiClient::new(), generation, commit)
            }
        }
    }
}
