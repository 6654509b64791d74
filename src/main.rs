use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use photosense::index::IndexClass;
use photosense::scan::{JobStatus, ScanJob};
use photosense::{logging, Config, Engine, SearchQuery};

#[derive(Parser, Debug)]
#[command(
    name = "photosense",
    version,
    about = "Index local photos, group faces into people and search by similarity"
)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true, env = "PHOTOSENSE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for log files when journald is not available
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import and analyze the photos in a folder
    Scan {
        folder: PathBuf,

        /// Only the folder itself, not its subfolders
        #[arg(long)]
        no_recursive: bool,
    },
    /// Re-detect faces on every imported photo and cluster again
    RescanFaces,
    /// Show a job, or the running or last one
    Status { job_id: Option<String> },
    /// List people with their face counts
    People,
    /// Photos showing a person
    PhotosOf { person_id: i64 },
    /// Assign a face to a person, or unassign it when no person is given
    AssignFace { face_id: i64, person_id: Option<i64> },
    /// Delete a wrongly detected face
    DeleteFace { face_id: i64 },
    /// Object categories, or the detections of one category or group
    Objects { category: Option<String> },
    /// Scene labels, or the photos carrying one
    Scenes { label: Option<String> },
    /// Most photographed places, or the photos taken at one
    Places {
        name: Option<String>,

        /// Photos without a known place instead
        #[arg(long, conflicts_with = "name")]
        unknown: bool,

        /// Number of places listed
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cluster all faces again without re-detecting them
    Recluster,
    /// Rebuild vector indices from the stored embeddings
    RebuildIndex {
        /// Only this index: face, pet or image
        #[arg(long)]
        class: Option<IndexClass>,
    },
    /// Name a person
    Rename { person_id: i64, name: String },
    /// Move the faces of the source people to the target and delete the sources
    Merge {
        target: i64,
        #[arg(required = true)]
        sources: Vec<i64>,
    },
    /// Delete a person
    DeletePerson {
        person_id: i64,

        /// Delete the person's faces as well instead of unassigning them
        #[arg(long)]
        with_faces: bool,
    },
    /// Delete a photo and everything detected in it
    DeletePhoto { photo_id: i64 },
    /// Similarity search
    Search {
        #[command(flatten)]
        query: QueryArgs,

        /// Index to search: face, pet or image. Must agree with the query.
        #[arg(long)]
        class: Option<IndexClass>,

        /// Number of results
        #[arg(short, default_value_t = 10)]
        k: usize,
    },
    /// Remove orphaned people and rows and stale index entries
    Cleanup,
    /// Manage user tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Row counts
    Stats,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct QueryArgs {
    /// Photos matching a text description
    #[arg(long)]
    text: Option<String>,

    /// Faces similar to this face
    #[arg(long)]
    face: Option<i64>,

    /// Pets similar to this pet detection
    #[arg(long)]
    pet: Option<i64>,

    /// Photos similar to this photo
    #[arg(long)]
    photo: Option<i64>,
}

impl QueryArgs {
    /// The index a query searches follows from what it starts from
    fn into_query(self) -> Result<(IndexClass, SearchQuery)> {
        if let Some(text) = self.text {
            return Ok((IndexClass::Image, SearchQuery::Text(text)));
        }
        if let Some(id) = self.face {
            return Ok((IndexClass::Face, SearchQuery::Face(id)));
        }
        if let Some(id) = self.pet {
            return Ok((IndexClass::Pet, SearchQuery::Pet(id)));
        }
        if let Some(id) = self.photo {
            return Ok((IndexClass::Image, SearchQuery::Photo(id)));
        }
        bail!("One of --text, --face, --pet or --photo is required")
    }
}

#[derive(Subcommand, Debug)]
enum TagAction {
    Add { photo_id: i64, tag: String },
    Remove { photo_id: i64, tag: String },
    /// Tags of one photo
    List { photo_id: i64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(cli.log_dir.clone());

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let engine = Engine::open(config)?;

    match cli.command {
        Command::Scan { folder, no_recursive } => {
            let recursive = engine.config().scanner.recursive && !no_recursive;
            let job_id = engine.start_scan(&folder, recursive)?;
            finish_job(&engine, &job_id)?;
        }
        Command::RescanFaces => {
            let job_id = engine.start_face_rescan()?;
            finish_job(&engine, &job_id)?;
        }
        Command::Status { job_id } => {
            let job_id = job_id.or_else(|| engine.get_global_status().current_job_id);
            if let Some(job) = job_id.as_deref().and_then(|id| engine.get_job_status(id).ok()) {
                print_job(&job);
            } else {
                let record = match &job_id {
                    Some(id) => engine.database().get_job(id)?,
                    None => engine.database().latest_job()?,
                };
                match (record, job_id) {
                    (Some(record), _) => println!(
                        "{} {} [{}] {}",
                        record.kind, record.id, record.status, record.message
                    ),
                    (None, Some(id)) => bail!("No job with id {}", id),
                    (None, None) => println!("No jobs yet"),
                }
            }
        }
        Command::People => {
            for person in engine.get_person_list()? {
                println!(
                    "{:>6}  {:<24} {} faces",
                    person.id,
                    person.name.as_deref().unwrap_or("(unnamed)"),
                    person.face_count
                );
            }
        }
        Command::PhotosOf { person_id } => {
            for photo in engine.photos_of_person(person_id)? {
                println!("{:>8}  {}", photo.id, photo.path);
            }
        }
        Command::AssignFace { face_id, person_id } => {
            if !engine.assign_face(face_id, person_id)? {
                bail!("No face with id {}", face_id);
            }
        }
        Command::DeleteFace { face_id } => {
            if !engine.delete_face(face_id)? {
                bail!("No face with id {}", face_id);
            }
        }
        Command::Objects { category: None } => {
            for (category, photos) in engine.object_categories()? {
                println!("{:<24} {} photos", category, photos);
            }
        }
        Command::Objects { category: Some(category) } => {
            for object in engine.objects_by_category(&category)? {
                println!(
                    "{:>8}  photo {:<8} {:<20} {:.2}",
                    object.id, object.photo_id, object.category, object.confidence
                );
            }
        }
        Command::Scenes { label: None } => {
            for scene in engine.scene_summary()? {
                println!(
                    "{:<24} {} photos (avg {:.2})",
                    scene.label, scene.photo_count, scene.avg_confidence
                );
            }
        }
        Command::Scenes { label: Some(label) } => print_ids(engine.photos_with_scene(&label)?),
        Command::Places { unknown: true, .. } => print_ids(engine.photos_without_place()?),
        Command::Places { name: Some(name), .. } => print_ids(engine.photos_at_place(&name)?),
        Command::Places { name: None, limit, .. } => {
            for place in engine.top_places(limit)? {
                let name = [&place.city, &place.region, &place.country]
                    .into_iter()
                    .flatten()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{:<40} {} photos", name, place.photo_count);
            }
        }
        Command::Recluster => {
            let outcome = engine.recluster()?;
            println!(
                "{} faces in {} clusters, {} new people, {} unassigned",
                outcome.faces,
                outcome.clusters,
                outcome.created_persons.len(),
                outcome.noise
            );
        }
        Command::RebuildIndex { class } => {
            let classes = match class {
                Some(class) => vec![class],
                None => IndexClass::ALL.to_vec(),
            };
            for class in classes {
                let count = engine.rebuild_index(class)?;
                println!("{}: {} vectors", class, count);
            }
        }
        Command::Rename { person_id, name } => {
            if !engine.rename_person(person_id, &name)? {
                bail!("No person with id {}", person_id);
            }
        }
        Command::Merge { target, sources } => {
            let outcome = engine.merge_persons(&sources, target)?;
            println!(
                "Moved {} faces, removed {} people",
                outcome.moved_faces,
                outcome.removed_persons.len()
            );
        }
        Command::DeletePerson { person_id, with_faces } => {
            match engine.delete_person(person_id, with_faces)? {
                Some(faces) if with_faces => println!("Deleted person and {} faces", faces.len()),
                Some(faces) => println!("Deleted person, {} faces unassigned", faces.len()),
                None => bail!("No person with id {}", person_id),
            }
        }
        Command::DeletePhoto { photo_id } => match engine.delete_photo(photo_id)? {
            Some(deleted) => println!("Deleted photo {} ({} faces)", photo_id, deleted.face_ids.len()),
            None => bail!("No photo with id {}", photo_id),
        },
        Command::Search { query, class, k } => {
            let (default_class, query) = query.into_query()?;
            let class = class.unwrap_or(default_class);
            for hit in engine.search(class, query, k)? {
                println!("{:>8}  {:.4}", hit.id, hit.score);
            }
        }
        Command::Cleanup => {
            let report = engine.cleanup()?;
            println!("Removed {} orphaned people", report.orphan_persons.len());
            println!(
                "Removed {} faces, {} objects, {} scenes, {} places without a photo",
                report.orphan_rows.faces,
                report.orphan_rows.objects,
                report.orphan_rows.scenes,
                report.orphan_rows.places
            );
            println!("Dropped {} stale index entries", report.stale_total());
            for (id, path) in &report.missing_files {
                println!("Missing file: {} (photo {})", path, id);
            }
        }
        Command::Tag { action } => match action {
            TagAction::Add { photo_id, tag } => {
                engine.add_tag(photo_id, &tag)?;
            }
            TagAction::Remove { photo_id, tag } => {
                engine.remove_tag(photo_id, &tag)?;
            }
            TagAction::List { photo_id } => {
                for tag in engine.tags(photo_id)? {
                    println!("{}", tag);
                }
            }
        },
        Command::Stats => {
            let stats = engine.statistics()?;
            println!("Photos:          {}", stats.photos);
            println!("  pending:       {}", stats.pending_photos);
            println!("  failed:        {}", stats.failed_photos);
            println!("Faces:           {}", stats.faces);
            println!("  unassigned:    {}", stats.unassigned_faces);
            println!("People:          {}", stats.persons);
            println!("Objects:         {}", stats.objects);
            println!("Scene labels:    {}", stats.scenes);
            println!("Tags:            {}", stats.tags);
            println!("Places:          {}", stats.places);
        }
    }

    Ok(())
}

/// Poll a background job until it finishes, printing progress on stderr
fn finish_job(engine: &Engine, job_id: &str) -> Result<()> {
    let mut last_message = String::new();
    let job = loop {
        let job = engine.get_job_status(job_id)?;
        if job.message != last_message {
            eprintln!("[{:>3.0}%] {}", job.progress * 100.0, job.message);
            last_message = job.message.clone();
        }
        if job.status.is_finished() {
            break job;
        }
        std::thread::sleep(Duration::from_millis(500));
    };

    print_job(&job);
    if job.status == JobStatus::Error {
        bail!("{}", job.error.unwrap_or(job.message));
    }
    Ok(())
}

fn print_ids(ids: Vec<i64>) {
    for id in ids {
        println!("{}", id);
    }
}

fn print_job(job: &ScanJob) {
    println!("{} {} [{}] {}", job.kind.as_str(), job.id, job.status, job.message);
    for warning in &job.warnings {
        println!("  warning: {}", warning);
    }
    for error in &job.sample_errors {
        println!("  failed: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_status_and_search_flags() {
        let cli = Cli::try_parse_from(["photosense", "scan", "/photos", "--no-recursive"]).unwrap();
        assert!(matches!(cli.command, Command::Scan { no_recursive: true, .. }));

        let cli = Cli::try_parse_from(["photosense", "status", "abc"]).unwrap();
        assert!(matches!(cli.command, Command::Status { job_id: Some(ref id) } if id == "abc"));
        let cli = Cli::try_parse_from(["photosense", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status { job_id: None }));

        let cli = Cli::try_parse_from(["photosense", "search", "--face", "3", "--class", "faces"]).unwrap();
        let Command::Search { query, class, .. } = cli.command else {
            panic!("expected search");
        };
        assert_eq!(class, Some(IndexClass::Face));
        assert_eq!(query.into_query().unwrap().0, IndexClass::Face);
        assert!(Cli::try_parse_from(["photosense", "search", "--face", "3", "--class", "cars"]).is_err());
    }

    #[test]
    fn test_places_unknown_conflicts_with_name() {
        assert!(Cli::try_parse_from(["photosense", "places", "Lisbon", "--unknown"]).is_err());
        let cli = Cli::try_parse_from(["photosense", "assign-face", "7"]).unwrap();
        assert!(matches!(cli.command, Command::AssignFace { face_id: 7, person_id: None }));
    }
}
