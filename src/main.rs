use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use heapfile::{
    BUFFER_POOL_SIZE, DiskManager, HeapFile, PageId, RecordId, SharedBufferManager, SlotId,
    shared_pool,
};
use log::info;
use prettytable::{Table, row};

/// Inspect and edit heap files stored in a paged database file
#[derive(Parser, Debug)]
#[command(name = "heapfile", version, about)]
struct Args {
    /// Database file, created on first use
    #[arg(long, value_name = "PATH", default_value = "heap.db")]
    db: PathBuf,

    /// Number of buffer pool frames
    #[arg(long, default_value_t = BUFFER_POOL_SIZE)]
    frames: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List heap files and their first page
    Files,
    /// Insert one record per argument, creating the file if needed
    Insert { file: String, records: Vec<String> },
    /// Print a record
    Get { file: String, page: u32, slot: SlotId },
    /// Overwrite a record in place
    Update {
        file: String,
        page: u32,
        slot: SlotId,
        record: String,
    },
    /// Delete a record
    Delete { file: String, page: u32, slot: SlotId },
    /// Print every record of a file
    Scan { file: String },
    /// Print the number of records in a file
    Count { file: String },
    /// Delete a file and free its pages
    Drop { file: String },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let disk_manager = DiskManager::open_or_create(&args.db)?;
    let pool = shared_pool(disk_manager, args.frames);

    run(&pool, args.command)?;

    pool.lock()
        .map_err(|_| "buffer pool mutex poisoned")?
        .flush_all()?;
    info!("flushed {}", args.db.display());
    Ok(())
}

fn run(pool: &SharedBufferManager, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Files => {
            let bm = pool.lock().map_err(|_| "buffer pool mutex poisoned")?;
            let mut table = Table::new();
            table.set_titles(row!["file", "first page"]);
            for (name, anchor) in bm.disk_manager().file_entries() {
                table.add_row(row![name, anchor]);
            }
            table.printstd();
        }
        Command::Insert { file, records } => {
            // The only command that creates a missing file
            let mut heap = HeapFile::open(pool.clone(), Some(file.as_str()))?;
            for record in records {
                let rid = heap.insert_record(record.as_bytes())?;
                println!("{rid}");
            }
        }
        Command::Get { file, page, slot } => {
            let heap = HeapFile::open_existing(pool.clone(), &file)?;
            let record = heap.get_record(record_id(page, slot))?;
            println!("{}", String::from_utf8_lossy(&record));
        }
        Command::Update {
            file,
            page,
            slot,
            record,
        } => {
            let mut heap = HeapFile::open_existing(pool.clone(), &file)?;
            heap.update_record(record_id(page, slot), record.as_bytes())?;
        }
        Command::Delete { file, page, slot } => {
            let mut heap = HeapFile::open_existing(pool.clone(), &file)?;
            heap.delete_record(record_id(page, slot))?;
        }
        Command::Scan { file } => {
            let heap = HeapFile::open_existing(pool.clone(), &file)?;
            let mut table = Table::new();
            table.set_titles(row!["page", "slot", "len", "data"]);
            for item in heap.open_scan() {
                let (rid, record) = item?;
                table.add_row(row![
                    rid.page_id,
                    rid.slot_id,
                    record.len(),
                    String::from_utf8_lossy(&record)
                ]);
            }
            table.printstd();
            println!("{} record(s)", heap.record_count());
        }
        Command::Count { file } => {
            let heap = HeapFile::open_existing(pool.clone(), &file)?;
            println!("{}", heap.record_count());
        }
        Command::Drop { file } => {
            let mut heap = HeapFile::open_existing(pool.clone(), &file)?;
            heap.delete_file()?;
            println!("dropped {file}");
        }
    }
    Ok(())
}

fn record_id(page: u32, slot: SlotId) -> RecordId {
    RecordId::new(PageId::new(page), slot)
}
