//! reference names of the azure devops work item fields we know about
use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Serialize, Serializer};

/// prefix of a field path inside a json patch document
pub const FIELD_PATH_PREFIX: &str = "/fields/";

macro_rules! work_item_fields {
	($($variant:ident => $name:literal,)*) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		/// well known work item field
		pub enum WorkItemField {
			$($variant,)*
		}

		impl WorkItemField {
			/// every known field
			pub const ALL: &'static [WorkItemField] = &[$(WorkItemField::$variant,)*];

			/// reference name of the field, e.g. `System.Title`
			pub const fn reference_name(&self) -> &'static str {
				match self {
					$(WorkItemField::$variant => $name,)*
				}
			}
		}
	};
}

work_item_fields! {
	// System
	Title => "System.Title",
	Description => "System.Description",
	State => "System.State",
	AreaId => "System.AreaId",
	AreaPath => "System.AreaPath",
	AssignedTo => "System.AssignedTo",
	AttachedFileCount => "System.AttachedFileCount",
	AuthorizedAs => "System.AuthorizedAs",
	AuthorizedDate => "System.AuthorizedDate",
	BoardColumn => "System.BoardColumn",
	BoardColumnDone => "System.BoardColumnDone",
	BoardLane => "System.BoardLane",
	ChangedBy => "System.ChangedBy",
	ChangedDate => "System.ChangedDate",
	CommentCount => "System.CommentCount",
	CreatedBy => "System.CreatedBy",
	CreatedDate => "System.CreatedDate",
	ExternalLinkCount => "System.ExternalLinkCount",
	History => "System.History",
	HyperLinkCount => "System.HyperLinkCount",
	Id => "System.Id",
	IterationId => "System.IterationId",
	IterationPath => "System.IterationPath",
	NodeName => "System.NodeName",
	Parent => "System.Parent",
	Reason => "System.Reason",
	RelatedLinkCount => "System.RelatedLinkCount",
	RemoteLinkCount => "System.RemoteLinkCount",
	Rev => "System.Rev",
	RevisedDate => "System.RevisedDate",
	Tags => "System.Tags",
	TeamProject => "System.TeamProject",
	Watermark => "System.Watermark",
	WorkItemType => "System.WorkItemType",

	// Microsoft.VSTS.Common
	AcceptanceCriteria => "Microsoft.VSTS.Common.AcceptanceCriteria",
	ActivatedBy => "Microsoft.VSTS.Common.ActivatedBy",
	ActivatedDate => "Microsoft.VSTS.Common.ActivatedDate",
	Activity => "Microsoft.VSTS.Common.Activity",
	BusinessValue => "Microsoft.VSTS.Common.BusinessValue",
	ClosedBy => "Microsoft.VSTS.Common.ClosedBy",
	ClosedDate => "Microsoft.VSTS.Common.ClosedDate",
	Issue => "Microsoft.VSTS.Common.Issue",
	Priority => "Microsoft.VSTS.Common.Priority",
	Rating => "Microsoft.VSTS.Common.Rating",
	ResolvedBy => "Microsoft.VSTS.Common.ResolvedBy",
	ResolvedDate => "Microsoft.VSTS.Common.ResolvedDate",
	ResolvedReason => "Microsoft.VSTS.Common.ResolvedReason",
	ReviewedBy => "Microsoft.VSTS.Common.ReviewedBy",
	Risk => "Microsoft.VSTS.Common.Risk",
	Severity => "Microsoft.VSTS.Common.Severity",
	StackRank => "Microsoft.VSTS.Common.StackRank",
	StateChangeDate => "Microsoft.VSTS.Common.StateChangeDate",
	StateCode => "Microsoft.VSTS.Common.StateCode",
	TimeCriticality => "Microsoft.VSTS.Common.TimeCriticality",
	ValueArea => "Microsoft.VSTS.Common.ValueArea",

	// Microsoft.VSTS.Scheduling
	CompletedWork => "Microsoft.VSTS.Scheduling.CompletedWork",
	DueDate => "Microsoft.VSTS.Scheduling.DueDate",
	Effort => "Microsoft.VSTS.Scheduling.Effort",
	FinishDate => "Microsoft.VSTS.Scheduling.FinishDate",
	OriginalEstimate => "Microsoft.VSTS.Scheduling.OriginalEstimate",
	RemainingWork => "Microsoft.VSTS.Scheduling.RemainingWork",
	StartDate => "Microsoft.VSTS.Scheduling.StartDate",
	StoryPoints => "Microsoft.VSTS.Scheduling.StoryPoints",
	TargetDate => "Microsoft.VSTS.Scheduling.TargetDate",

	// Microsoft.VSTS.Build
	FoundIn => "Microsoft.VSTS.Build.FoundIn",
	IntegrationBuild => "Microsoft.VSTS.Build.IntegrationBuild",

	// Microsoft.VSTS.CodeReview
	AcceptedBy => "Microsoft.VSTS.CodeReview.AcceptedBy",
	AcceptedDate => "Microsoft.VSTS.CodeReview.AcceptedDate",
	ClosedStatus => "Microsoft.VSTS.CodeReview.ClosedStatus",
	ClosedStatusCode => "Microsoft.VSTS.CodeReview.ClosedStatusCode",
	ClosingComment => "Microsoft.VSTS.CodeReview.ClosingComment",
	Context => "Microsoft.VSTS.CodeReview.Context",
	ContextCode => "Microsoft.VSTS.CodeReview.ContextCode",
	ContextOwner => "Microsoft.VSTS.CodeReview.ContextOwner",
	ContextType => "Microsoft.VSTS.CodeReview.ContextType",

	// Microsoft.VSTS.Feedback
	ApplicationLaunchInstructions => "Microsoft.VSTS.Feedback.ApplicationLaunchInstructions",
	ApplicationStartInformation => "Microsoft.VSTS.Feedback.ApplicationStartInformation",
	ApplicationType => "Microsoft.VSTS.Feedback.ApplicationType",

	// Microsoft.VSTS.TCM
	AutomatedTestId => "Microsoft.VSTS.TCM.AutomatedTestId",
	AutomatedTestName => "Microsoft.VSTS.TCM.AutomatedTestName",
	AutomatedTestStorage => "Microsoft.VSTS.TCM.AutomatedTestStorage",
	AutomatedTestType => "Microsoft.VSTS.TCM.AutomatedTestType",
	AutomationStatus => "Microsoft.VSTS.TCM.AutomationStatus",
	LocalDataSource => "Microsoft.VSTS.TCM.LocalDataSource",
	Parameters => "Microsoft.VSTS.TCM.Parameters",
	QueryText => "Microsoft.VSTS.TCM.QueryText",
	ReproSteps => "Microsoft.VSTS.TCM.ReproSteps",
	Steps => "Microsoft.VSTS.TCM.Steps",
	SystemInfo => "Microsoft.VSTS.TCM.SystemInfo",
	TestSuiteAudit => "Microsoft.VSTS.TCM.TestSuiteAudit",
	TestSuiteType => "Microsoft.VSTS.TCM.TestSuiteType",
	TestSuiteTypeId => "Microsoft.VSTS.TCM.TestSuiteTypeId",
}

static LOOKUP: Lazy<HashMap<&'static str, WorkItemField>> = Lazy::new(|| {
	WorkItemField::ALL.iter().map(|field| (field.reference_name(), *field)).collect()
});

impl WorkItemField {
	/// path of the field inside a json patch document, e.g. `/fields/System.Title`
	pub fn field_path(&self) -> String {
		format!("{FIELD_PATH_PREFIX}{}", self.reference_name())
	}

	/// Looks up a known field by its reference name or by its patch path.
	/// Returns [None] for fields outside of the known set.
	pub fn parse(name: &str) -> Option<Self> {
		let name = name.strip_prefix(FIELD_PATH_PREFIX).unwrap_or(name);
		LOOKUP.get(name).copied()
	}
}

impl std::fmt::Display for WorkItemField {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.reference_name())
	}
}

impl Serialize for WorkItemField {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.reference_name())
	}
}

/// Patch path for a configured field name: the canonical path of a known field,
/// `/fields/<name>` for everything else.
pub fn field_path_for(name: &str) -> String {
	match WorkItemField::parse(name) {
		Some(field) => field.field_path(),
		None => format!("{FIELD_PATH_PREFIX}{name}"),
	}
}
