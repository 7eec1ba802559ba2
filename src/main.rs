use anyhow::Result;
use inquire::{Confirm, Select, Text};
use std::sync::Arc;

use storyloom::core::config::Config;
use storyloom::core::dialogue::mark_dialogue;
use storyloom::core::state::{AudioStatus, PipelineStage};
use storyloom::services::gateway::{Gateway, HttpGateway};
use storyloom::services::monitor::StatusMonitor;
use storyloom::services::pipeline::PipelineManager;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = Config::load()?;

    // 1. Pick (or create) a project
    let project = match &config.project {
        Some(id) => id.clone(),
        None => {
            let id = choose_project(&config).await?;
            config.project = Some(id.clone());
            if let Err(e) = config.save() {
                log::warn!("could not persist project choice: {:#}", e);
            }
            id
        }
    };

    // 2. Wire up the engine
    let gateway = Arc::new(HttpGateway::new(&config.server.base_url, &project));
    let monitor = StatusMonitor::connect(&config.server.base_url).ok();

    let mut manager = PipelineManager::new(gateway, &config.audio);
    if let Some(monitor) = &monitor {
        manager = manager.with_provider_gate(monitor.providers());
    }

    // 3. Resume wherever the project left off
    let stage = manager.bootstrap().await?;
    println!("Project {} resumed at the {:?} step.", project, stage);

    run_menu(&manager, &config).await
}

async fn choose_project(config: &Config) -> Result<String> {
    let gateway = HttpGateway::new(&config.server.base_url, "");
    let projects = gateway.list_projects().await?;

    const NEW_PROJECT: &str = "<new project>";
    let mut options: Vec<String> = projects
        .iter()
        .map(|p| format!("{} ({})", p.title, p.id))
        .collect();
    options.push(NEW_PROJECT.to_string());

    let choice = Select::new("Open project:", options).prompt()?;
    if choice != NEW_PROJECT {
        let idx = projects
            .iter()
            .position(|p| choice.ends_with(&format!("({})", p.id)))
            .unwrap_or(0);
        return Ok(projects[idx].id.clone());
    }

    let title = Text::new("Project title:").prompt()?;
    let language = Select::new("Language:", vec!["en", "ru", "de"]).prompt()?;
    let project = gateway.create_project(&title, language).await?;
    Ok(project.id)
}

async fn run_menu(manager: &PipelineManager, config: &Config) -> Result<()> {
    loop {
        print_summary(manager);

        let actions = vec![
            "Refine idea",
            "Select idea",
            "Generate plot",
            "Generate cast",
            "Plan current chapter",
            "Write beat",
            "Preview beat markup",
            "Clear beat",
            "Clear from beat",
            "Generate audio",
            "Previous chapter",
            "Next chapter",
            "Reset project",
            "Quit",
        ];

        let action = Select::new("Action:", actions).prompt()?;
        // engine operations surface their own notices; the menu just loops
        let result = match action {
            "Refine idea" => {
                let genre = Text::new("Genre:").prompt()?;
                let idea = Text::new("Idea:").prompt()?;
                manager.refine(&genre, &idea).await
            }
            "Select idea" => {
                let st = manager.snapshot();
                if st.variations.is_empty() {
                    println!("No variations yet, refine an idea first.");
                    Ok(())
                } else {
                    let titles: Vec<String> =
                        st.variations.iter().map(|v| v.title.clone()).collect();
                    let pick = Select::new("Variation:", titles.clone()).prompt()?;
                    let index = titles.iter().position(|t| *t == pick).unwrap_or(0);
                    manager.select_idea(index);
                    Ok(())
                }
            }
            "Generate plot" => manager.generate_plot().await,
            "Generate cast" => manager.generate_cast().await,
            "Plan current chapter" => manager.plan_chapter().await,
            "Write beat" => match ask_beat_index(manager)? {
                Some(index) => manager.write_beat(index).await,
                None => Ok(()),
            },
            "Preview beat markup" => {
                match ask_beat_index(manager)? {
                    Some(index) => {
                        let st = manager.snapshot();
                        match st.beat_texts.get(&index) {
                            Some(text) => println!("{}", mark_dialogue(text)),
                            None => println!("Beat {} is not written yet.", index),
                        }
                    }
                    None => {}
                }
                Ok(())
            }
            "Clear beat" => match ask_beat_index(manager)? {
                Some(index) => manager.clear_beat(index).await,
                None => Ok(()),
            },
            "Clear from beat" => match ask_beat_index(manager)? {
                Some(index) => manager.clear_from(index).await,
                None => Ok(()),
            },
            "Generate audio" => {
                match ask_beat_index(manager)? {
                    Some(index) => {
                        let providers: Vec<&str> =
                            config.audio.providers.iter().map(String::as_str).collect();
                        let provider = Select::new("Provider:", providers).prompt()?;
                        let force = Confirm::new("Force regeneration?")
                            .with_default(false)
                            .prompt()?;
                        let _ = manager.request_audio(index, provider, force).await;
                    }
                    None => {}
                }
                Ok(())
            }
            "Previous chapter" => {
                let chapter = manager.snapshot().chapter;
                manager.goto_chapter(chapter.saturating_sub(1)).await
            }
            "Next chapter" => {
                let chapter = manager.snapshot().chapter;
                manager.goto_chapter(chapter + 1).await
            }
            "Reset project" => {
                if Confirm::new("Wipe the whole project?")
                    .with_default(false)
                    .prompt()?
                {
                    manager.reset_project().await
                } else {
                    Ok(())
                }
            }
            _ => return Ok(()),
        };

        if let Err(e) = result {
            eprintln!("Error: {:#}", e);
        }
    }
}

fn ask_beat_index(manager: &PipelineManager) -> Result<Option<usize>> {
    let st = manager.snapshot();
    let count = st.beat_count();
    if count == 0 {
        println!("No beat plan for this chapter yet.");
        return Ok(None);
    }

    let labels: Vec<String> = (0..count)
        .map(|i| {
            let written = if st.is_written(i) { "written" } else { "empty" };
            let audio: Vec<String> = st
                .audio
                .iter()
                .filter(|((beat, _), _)| *beat == i)
                .map(|((_, provider), job)| {
                    format!("{}: {}", provider, status_label(job.status))
                })
                .collect();
            if audio.is_empty() {
                format!("Beat {} ({})", i, written)
            } else {
                format!("Beat {} ({}; {})", i, written, audio.join(", "))
            }
        })
        .collect();

    let pick = Select::new("Beat:", labels.clone()).prompt()?;
    Ok(labels.iter().position(|l| *l == pick))
}

fn status_label(status: AudioStatus) -> &'static str {
    match status {
        AudioStatus::Missing => "missing",
        AudioStatus::Generating => "generating",
        AudioStatus::Ready => "ready",
        AudioStatus::Error => "error",
        AudioStatus::Playing => "playing",
        AudioStatus::Paused => "paused",
    }
}

fn print_summary(manager: &PipelineManager) {
    let st = manager.snapshot();
    println!();
    match st.stage() {
        PipelineStage::Idea => println!("Step 1: refine and select an idea."),
        PipelineStage::Plot => println!(
            "Step 2: generate the plot for \"{}\".",
            st.selected.as_ref().map(|s| s.title.as_str()).unwrap_or("")
        ),
        PipelineStage::Cast => println!("Step 3: generate the cast."),
        PipelineStage::Beats => println!("Step 4: plan chapter {}.", st.chapter),
        PipelineStage::Write => {
            let written = (0..st.beat_count()).filter(|&i| st.is_written(i)).count();
            println!(
                "Chapter {}/{}: {}/{} beats written.",
                st.chapter,
                st.total_chapters(),
                written,
                st.beat_count()
            );
        }
    }
}
